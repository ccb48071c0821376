//! TaskDispatcher - 1 タスク分の処理を監督する
//!
//! # フロー
//! 1. LockRenewer を起動（interval = lock_duration - renewal_buffer）
//! 2. Handler を別 task で実行（panic も失敗として捕まえる）
//! 3. LockRenewer を止めて in-flight の延長を待つ
//! 4. 失敗なら ServiceError に変換
//! 5. TaskResult に対応する report を 1 回だけ送る（有限回リトライ付き）
//!
//! `execute()` はエラーを返しません。失敗は全てここで吸収してログに残します。

use std::any::Any;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinError;
use tracing::{Instrument, error, info, info_span};

use super::config::WorkerConfig;
use super::lock_renewer::LockRenewer;
use super::report::report_with_retry;
use crate::domain::{ExternalTask, HandlerError, Identity, TaskResult, WorkerId};
use crate::ports::TaskApiPort;
use crate::typed::DynHandler;

#[derive(Clone)]
pub struct TaskDispatcher {
    api: Arc<dyn TaskApiPort>,
    worker_id: WorkerId,
    config: WorkerConfig,
}

impl TaskDispatcher {
    pub fn new(api: Arc<dyn TaskApiPort>, worker_id: WorkerId, config: WorkerConfig) -> Self {
        Self {
            api,
            worker_id,
            config,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Process one task end to end. Never fails.
    pub async fn execute(
        &self,
        identity: Identity,
        task: ExternalTask<Value>,
        handler: Arc<dyn DynHandler>,
    ) {
        let span = info_span!(
            "external_task",
            worker_id = %self.worker_id,
            task_id = %task.id,
            topic = %task.topic,
        );
        self.execute_inner(identity, task, handler)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        identity: Identity,
        task: ExternalTask<Value>,
        handler: Arc<dyn DynHandler>,
    ) {
        let task_id = task.id.clone();

        let renewer = LockRenewer::start(
            self.api.clone(),
            identity.clone(),
            self.worker_id.clone(),
            task_id.clone(),
            self.config.lock_duration,
            self.config.renewal_interval(),
        );

        let outcome = invoke(handler, task).await;

        // report より前に延長を止める（report 後に extend_lock が飛ばないように）
        renewer.shutdown().await;

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, details = err.details(), "failed to execute external task");
                let (message, details) = err.into_parts();
                TaskResult::ServiceError { message, details }
            }
        };

        info!(kind = ?result.kind(), "reporting task result");
        if let Err(err) = report_with_retry(
            self.api.as_ref(),
            &identity,
            &self.worker_id,
            &task_id,
            &result,
            &self.config.report_retry,
        )
        .await
        {
            // engine 側は lock の期限切れで回収する
            error!(error = %err, "dropping task after report failures");
        }
    }
}

/// Run the handler on its own task so a panic surfaces as a `HandlerError`.
async fn invoke(
    handler: Arc<dyn DynHandler>,
    task: ExternalTask<Value>,
) -> Result<TaskResult<Value>, HandlerError> {
    let handle = tokio::spawn(async move { handler.handle_dyn(task).await }.in_current_span());
    match handle.await {
        Ok(outcome) => outcome,
        Err(err) => Err(join_error_to_handler_error(err)),
    }
}

fn join_error_to_handler_error(err: JoinError) -> HandlerError {
    if err.is_panic() {
        let message = panic_message(err.into_panic());
        HandlerError::new(format!("handler panicked: {message}"))
    } else {
        HandlerError::new(format!("handler task was cancelled: {err}"))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
