//! InMemoryTaskApi - 開発用・テスト用の fake engine
//!
//! # 実装詳細
//! - 全ての呼び出しを `RecordedCall` として記録（発行時刻・Authorization ヘッダ付き）
//! - `push_batch()` でスクリプト化した fetch 結果を返す。なければ `enqueue()` されたタスクから取る
//! - lock を管理し、report 済み・未 lock・期限切れのタスクへの extend / report は 404 を返す
//! - `fail_next()` で指定した操作を N 回失敗させる
//!
//! # 使用例
//! ```ignore
//! let api = Arc::new(InMemoryTaskApi::new());
//! api.enqueue("billing", json!({ "amount": 10 }));
//! // ... run a worker against `api` ...
//! assert_eq!(api.count(Operation::Finish), 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::domain::{ExternalTask, ExternalTaskId, Identity, TaskApiError, WorkerId};
use crate::ports::TaskApiPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchAndLock,
    ExtendLock,
    Finish,
    HandleBpmnError,
    HandleServiceError,
}

impl Operation {
    pub fn is_report(self) -> bool {
        matches!(
            self,
            Self::Finish | Self::HandleBpmnError | Self::HandleServiceError
        )
    }
}

/// One call as the engine saw it.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    FetchAndLock {
        worker_id: WorkerId,
        topic: String,
        max_tasks: u32,
        long_polling_timeout: Duration,
        lock_duration: Duration,
    },
    ExtendLock {
        worker_id: WorkerId,
        task_id: ExternalTaskId,
        additional_duration: Duration,
    },
    Finish {
        worker_id: WorkerId,
        task_id: ExternalTaskId,
        result: Value,
    },
    HandleBpmnError {
        worker_id: WorkerId,
        task_id: ExternalTaskId,
        error_code: String,
    },
    HandleServiceError {
        worker_id: WorkerId,
        task_id: ExternalTaskId,
        message: String,
        details: String,
    },
}

impl ApiCall {
    pub fn operation(&self) -> Operation {
        match self {
            Self::FetchAndLock { .. } => Operation::FetchAndLock,
            Self::ExtendLock { .. } => Operation::ExtendLock,
            Self::Finish { .. } => Operation::Finish,
            Self::HandleBpmnError { .. } => Operation::HandleBpmnError,
            Self::HandleServiceError { .. } => Operation::HandleServiceError,
        }
    }

    pub fn task_id(&self) -> Option<&ExternalTaskId> {
        match self {
            Self::FetchAndLock { .. } => None,
            Self::ExtendLock { task_id, .. }
            | Self::Finish { task_id, .. }
            | Self::HandleBpmnError { task_id, .. }
            | Self::HandleServiceError { task_id, .. } => Some(task_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub at: Instant,
    pub authorization: Option<String>,
    pub call: ApiCall,
}

#[derive(Debug)]
struct Lock {
    worker_id: WorkerId,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    scripted: VecDeque<Vec<ExternalTask<Value>>>,
    pending: VecDeque<ExternalTask<Value>>,
    locks: HashMap<ExternalTaskId, Lock>,
    failures: HashMap<Operation, u32>,
    calls: Vec<RecordedCall>,
}

/// In-memory engine that records every call.
#[derive(Default)]
pub struct InMemoryTaskApi {
    state: Mutex<State>,
    /// enqueue 時の通知用（long polling 中の fetch を起こす）
    notify: Notify,
}

impl InMemoryTaskApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task that any fetch for `topic` may pick up.
    pub fn enqueue(&self, topic: &str, payload: Value) -> ExternalTaskId {
        let task_id = ExternalTaskId::generate();
        self.state()
            .pending
            .push_back(ExternalTask::new(task_id.clone(), topic, payload));
        self.notify.notify_waiters();
        task_id
    }

    /// The next fetch returns exactly `batch`, ignoring topic and max_tasks.
    pub fn push_batch(&self, batch: Vec<ExternalTask<Value>>) {
        self.state().scripted.push_back(batch);
        self.notify.notify_waiters();
    }

    /// Make the next `times` calls of `operation` fail with a transport error.
    pub fn fail_next(&self, operation: Operation, times: u32) {
        *self.state().failures.entry(operation).or_default() += times;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn calls_for(&self, operation: Operation) -> Vec<RecordedCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.call.operation() == operation)
            .cloned()
            .collect()
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.call.operation() == operation)
            .count()
    }

    /// Tasks currently locked by some worker.
    pub fn locked_tasks(&self) -> Vec<ExternalTaskId> {
        self.state().locks.keys().cloned().collect()
    }

    /// When the engine would consider the lock on `task_id` expired.
    pub fn lock_expires_at(&self, task_id: &ExternalTaskId) -> Option<Instant> {
        self.state().locks.get(task_id).map(|lock| lock.expires_at)
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // poison はテスト中の panic でしか起きないので中身をそのまま使う
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the call, then apply any injected failure.
    fn record(&self, identity: &Identity, call: ApiCall) -> Result<(), TaskApiError> {
        let operation = call.operation();
        let mut state = self.state();
        state.calls.push(RecordedCall {
            at: Instant::now(),
            authorization: identity.bearer_header(),
            call,
        });

        if let Some(left) = state.failures.get_mut(&operation)
            && *left > 0
        {
            *left -= 1;
            return Err(TaskApiError::Transport(format!(
                "injected {operation:?} failure"
            )));
        }
        Ok(())
    }

    fn try_take(
        &self,
        worker_id: &WorkerId,
        topic: &str,
        max_tasks: u32,
        lock_duration: Duration,
    ) -> Option<Vec<ExternalTask<Value>>> {
        let mut state = self.state();

        let batch = if let Some(batch) = state.scripted.pop_front() {
            batch
        } else {
            let mut batch = Vec::new();
            let mut rest = VecDeque::new();
            while let Some(task) = state.pending.pop_front() {
                if task.topic == topic && batch.len() < max_tasks as usize {
                    batch.push(task);
                } else {
                    rest.push_back(task);
                }
            }
            state.pending = rest;
            if batch.is_empty() {
                return None;
            }
            batch
        };

        let expires_at = Instant::now() + lock_duration;
        let mut locked = Vec::with_capacity(batch.len());
        for mut task in batch {
            task.worker_id = Some(worker_id.to_string());
            state.locks.insert(
                task.id.clone(),
                Lock {
                    worker_id: worker_id.clone(),
                    expires_at,
                },
            );
            locked.push(task);
        }
        Some(locked)
    }

    fn check_lock(
        &self,
        worker_id: &WorkerId,
        task_id: &ExternalTaskId,
    ) -> Result<(), TaskApiError> {
        let state = self.state();
        match state.locks.get(task_id) {
            Some(lock) if lock.expires_at <= Instant::now() => Err(TaskApiError::Status {
                status: 404,
                body: format!("lock on task {task_id} expired"),
            }),
            Some(lock) if &lock.worker_id == worker_id => Ok(()),
            Some(_) => Err(TaskApiError::Status {
                status: 423,
                body: format!("task {task_id} is locked by another worker"),
            }),
            None => Err(TaskApiError::Status {
                status: 404,
                body: format!("no locked task {task_id}"),
            }),
        }
    }

    fn release(&self, worker_id: &WorkerId, task_id: &ExternalTaskId) -> Result<(), TaskApiError> {
        self.check_lock(worker_id, task_id)?;
        self.state().locks.remove(task_id);
        Ok(())
    }
}

#[async_trait]
impl TaskApiPort for InMemoryTaskApi {
    async fn fetch_and_lock(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        topic: &str,
        max_tasks: u32,
        long_polling_timeout: Duration,
        lock_duration: Duration,
    ) -> Result<Vec<ExternalTask<Value>>, TaskApiError> {
        self.record(
            identity,
            ApiCall::FetchAndLock {
                worker_id: worker_id.clone(),
                topic: topic.to_string(),
                max_tasks,
                long_polling_timeout,
                lock_duration,
            },
        )?;

        let deadline = Instant::now() + long_polling_timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(batch) = self.try_take(worker_id, topic, max_tasks, lock_duration) {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn extend_lock(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        task_id: &ExternalTaskId,
        additional_duration: Duration,
    ) -> Result<(), TaskApiError> {
        self.record(
            identity,
            ApiCall::ExtendLock {
                worker_id: worker_id.clone(),
                task_id: task_id.clone(),
                additional_duration,
            },
        )?;
        self.check_lock(worker_id, task_id)?;

        if let Some(lock) = self.state().locks.get_mut(task_id) {
            lock.expires_at = Instant::now() + additional_duration;
        }
        Ok(())
    }

    async fn finish(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        task_id: &ExternalTaskId,
        result: &Value,
    ) -> Result<(), TaskApiError> {
        self.record(
            identity,
            ApiCall::Finish {
                worker_id: worker_id.clone(),
                task_id: task_id.clone(),
                result: result.clone(),
            },
        )?;
        self.release(worker_id, task_id)
    }

    async fn handle_bpmn_error(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        task_id: &ExternalTaskId,
        error_code: &str,
    ) -> Result<(), TaskApiError> {
        self.record(
            identity,
            ApiCall::HandleBpmnError {
                worker_id: worker_id.clone(),
                task_id: task_id.clone(),
                error_code: error_code.to_string(),
            },
        )?;
        self.release(worker_id, task_id)
    }

    async fn handle_service_error(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        task_id: &ExternalTaskId,
        message: &str,
        details: &str,
    ) -> Result<(), TaskApiError> {
        self.record(
            identity,
            ApiCall::HandleServiceError {
                worker_id: worker_id.clone(),
                task_id: task_id.clone(),
                message: message.to_string(),
                details: details.to_string(),
            },
        )?;
        self.release(worker_id, task_id)
    }
}
