//! PollLoop - fetch → dispatch-all → wait-all を繰り返す
//!
//! # フロー
//! 1. shutdown が来ていたら抜ける
//! 2. IdentityProvider から今回の identity を取得（batch ごとに 1 回）
//! 3. fetch_and_lock
//!    - 失敗: error ログ → fetch_retry_delay 待って再試行（上限なし）
//!    - 0 件: fetch_retry_delay 待って再試行
//! 4. 全タスクを JoinSet で並行 dispatch し、全部 report されるまで待つ
//!
//! # shutdown
//! - fetch の前と待機中だけを見る
//! - in-flight の fetch / タスク処理は中断しない（取れた batch は最後まで処理する）
//! - shutdown の Sender が drop された場合も停止扱い

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::config::WorkerConfig;
use super::dispatcher::TaskDispatcher;
use crate::domain::{ExternalTask, Identity, WorkerId};
use crate::ports::{IdentityProvider, TaskApiPort};
use crate::typed::DynHandler;

pub struct PollLoop {
    api: Arc<dyn TaskApiPort>,
    dispatcher: TaskDispatcher,
    worker_id: WorkerId,
    config: WorkerConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl PollLoop {
    pub fn new(api: Arc<dyn TaskApiPort>, worker_id: WorkerId, config: WorkerConfig) -> Self {
        let dispatcher = TaskDispatcher::new(api.clone(), worker_id.clone(), config.clone());
        Self {
            api,
            dispatcher,
            worker_id,
            config,
            shutdown: None,
        }
    }

    /// Stop the loop once `true` is sent (or the sender is dropped).
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Poll `topic` until shutdown. Without a shutdown receiver this never returns.
    pub async fn run(
        &self,
        identity: &dyn IdentityProvider,
        topic: &str,
        max_tasks: u32,
        long_polling_timeout: Duration,
        handler: Arc<dyn DynHandler>,
    ) {
        let mut shutdown = self.shutdown.clone();
        info!(worker_id = %self.worker_id, topic, max_tasks, "polling started");

        while !stop_requested(shutdown.as_ref()) {
            let identity = identity.identity();

            let tasks = match self
                .api
                .fetch_and_lock(
                    &identity,
                    &self.worker_id,
                    topic,
                    max_tasks,
                    long_polling_timeout,
                    self.config.lock_duration,
                )
                .await
            {
                Ok(tasks) => tasks,
                Err(err) => {
                    error!(
                        worker_id = %self.worker_id,
                        topic,
                        error = %err,
                        retry_in = ?self.config.fetch_retry_delay,
                        "failed to fetch and lock external tasks"
                    );
                    if self.pause(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if tasks.is_empty() {
                debug!(worker_id = %self.worker_id, topic, "no external tasks available");
                if self.pause(&mut shutdown).await {
                    break;
                }
                continue;
            }

            self.dispatch_batch(identity, tasks, &handler).await;
        }

        info!(worker_id = %self.worker_id, topic, "polling stopped");
    }

    /// Dispatch every task of the batch concurrently and wait for all of them.
    async fn dispatch_batch(
        &self,
        identity: Identity,
        tasks: Vec<ExternalTask<Value>>,
        handler: &Arc<dyn DynHandler>,
    ) {
        debug!(worker_id = %self.worker_id, count = tasks.len(), "dispatching batch");

        let mut set = JoinSet::new();
        for task in tasks {
            let dispatcher = self.dispatcher.clone();
            let identity = identity.clone();
            let handler = handler.clone();
            set.spawn(async move { dispatcher.execute(identity, task, handler).await });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(err) = joined {
                error!(worker_id = %self.worker_id, error = %err, "task dispatch ended abnormally");
            }
        }
    }

    /// Wait `fetch_retry_delay`. Returns `true` if shutdown fired meanwhile.
    async fn pause(&self, shutdown: &mut Option<watch::Receiver<bool>>) -> bool {
        let delay = self.config.fetch_retry_delay;
        match shutdown {
            None => {
                tokio::time::sleep(delay).await;
                false
            }
            Some(rx) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    // Err は Sender の drop。どちらも停止扱い
                    _ = rx.wait_for(|stop| *stop) => true,
                }
            }
        }
    }
}

fn stop_requested(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    match shutdown {
        None => false,
        Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandlerError, TaskResult};
    use crate::impls::memory::{InMemoryTaskApi, Operation};
    use crate::ports::SharedIdentity;
    use crate::typed::{TypedHandler, handler_fn};
    use serde_json::json;
    use tokio::task::JoinHandle;

    fn worker() -> WorkerId {
        WorkerId::new("worker-poll")
    }

    fn echo() -> Arc<dyn DynHandler> {
        Arc::new(TypedHandler::<Value, Value, _>::new(handler_fn(
            |task: ExternalTask<Value>| async move { Ok(TaskResult::success(task.payload)) },
        )))
    }

    struct Running {
        stop: watch::Sender<bool>,
        join: JoinHandle<()>,
    }

    impl Running {
        async fn stop(self) {
            self.stop.send(true).unwrap();
            self.join.await.unwrap();
        }
    }

    fn spawn_loop(
        api: Arc<InMemoryTaskApi>,
        identity: impl IdentityProvider + 'static,
        max_tasks: u32,
        handler: Arc<dyn DynHandler>,
    ) -> Running {
        let (stop, rx) = watch::channel(false);
        let poll = PollLoop::new(api, worker(), WorkerConfig::default()).with_shutdown(rx);
        let join = tokio::spawn(async move {
            poll.run(&identity, "t", max_tasks, Duration::ZERO, handler)
                .await
        });
        Running { stop, join }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_fully_reported_before_next_fetch() {
        let api = Arc::new(InMemoryTaskApi::new());
        api.push_batch(vec![
            ExternalTask::new("a", "t", json!(1)),
            ExternalTask::new("b", "t", json!(2)),
        ]);

        let running = spawn_loop(api.clone(), Identity::anonymous(), 10, echo());
        tokio::time::sleep(Duration::from_millis(500)).await;
        running.stop().await;

        let ops: Vec<Operation> = api.calls().iter().map(|c| c.call.operation()).collect();
        assert_eq!(
            ops,
            vec![
                Operation::FetchAndLock,
                Operation::Finish,
                Operation::Finish,
                Operation::FetchAndLock,
            ]
        );
        assert_eq!(api.count(Operation::HandleServiceError), 0);
        assert_eq!(api.count(Operation::HandleBpmnError), 0);
        assert!(api.locked_tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_of_one_batch_run_concurrently() {
        let api = Arc::new(InMemoryTaskApi::new());
        api.push_batch(vec![
            ExternalTask::new("a", "t", json!(1)),
            ExternalTask::new("b", "t", json!(2)),
            ExternalTask::new("c", "t", json!(3)),
        ]);

        let handler: Arc<dyn DynHandler> = Arc::new(TypedHandler::<Value, Value, _>::new(
            handler_fn(|task: ExternalTask<Value>| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(TaskResult::success(task.payload))
            }),
        ));

        let start = tokio::time::Instant::now();
        let running = spawn_loop(api.clone(), Identity::anonymous(), 10, handler);
        tokio::time::sleep(Duration::from_millis(10_500)).await;

        let finishes = api.calls_for(Operation::Finish);
        assert_eq!(finishes.len(), 3);
        assert!(
            finishes
                .iter()
                .all(|c| c.at - start < Duration::from_millis(10_500))
        );

        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failures_are_retried_after_fixed_delay() {
        let api = Arc::new(InMemoryTaskApi::new());
        api.fail_next(Operation::FetchAndLock, 2);
        api.enqueue("t", json!("x"));

        let running = spawn_loop(api.clone(), Identity::anonymous(), 10, echo());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        running.stop().await;

        let fetches = api.calls_for(Operation::FetchAndLock);
        assert!(fetches.len() >= 3);
        let waited = fetches[2].at - fetches[0].at;
        assert!(waited >= Duration::from_millis(2000));
        assert!(waited < Duration::from_millis(2100));
        assert_eq!(api.count(Operation::Finish), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_callback_is_reported_and_loop_continues() {
        let api = Arc::new(InMemoryTaskApi::new());
        api.enqueue("t", json!("explode"));
        api.enqueue("t", json!("fine"));

        let handler: Arc<dyn DynHandler> = Arc::new(TypedHandler::<String, String, _>::new(
            handler_fn(|task: ExternalTask<String>| async move {
                if task.payload == "explode" {
                    return Err(HandlerError::new("boom"));
                }
                Ok(TaskResult::success(task.payload))
            }),
        ));

        let running = spawn_loop(api.clone(), Identity::anonymous(), 1, handler);
        tokio::time::sleep(Duration::from_millis(500)).await;
        running.stop().await;

        let errors = api.calls_for(Operation::HandleServiceError);
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0].call,
            crate::impls::memory::ApiCall::HandleServiceError { message, .. } if message == "boom"
        ));
        assert_eq!(api.count(Operation::Finish), 1);
        assert_eq!(api.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_current_batch_finish_and_prevents_next_fetch() {
        let api = Arc::new(InMemoryTaskApi::new());
        api.enqueue("t", json!(null));

        let handler: Arc<dyn DynHandler> = Arc::new(TypedHandler::<Value, Value, _>::new(
            handler_fn(|_task: ExternalTask<Value>| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(TaskResult::success(json!("late")))
            }),
        ));

        let running = spawn_loop(api.clone(), Identity::anonymous(), 10, handler);
        tokio::time::sleep(Duration::from_secs(1)).await;
        running.stop().await;

        assert_eq!(api.count(Operation::FetchAndLock), 1);
        assert_eq!(api.count(Operation::Finish), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_start_issues_no_fetch() {
        let api = Arc::new(InMemoryTaskApi::new());
        let (stop, rx) = watch::channel(false);
        stop.send(true).unwrap();

        PollLoop::new(api.clone(), worker(), WorkerConfig::default())
            .with_shutdown(rx)
            .run(&Identity::anonymous(), "t", 1, Duration::ZERO, echo())
            .await;

        assert!(api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sender_stops_the_loop() {
        let api = Arc::new(InMemoryTaskApi::new());
        let (stop, rx) = watch::channel(false);
        let poll = PollLoop::new(api.clone(), worker(), WorkerConfig::default()).with_shutdown(rx);
        let join = tokio::spawn(async move {
            poll.run(&Identity::anonymous(), "t", 1, Duration::ZERO, echo())
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(stop);
        join.await.unwrap();

        assert_eq!(api.count(Operation::FetchAndLock), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn identity_is_resolved_for_every_fetch() {
        let api = Arc::new(InMemoryTaskApi::new());
        let shared = Arc::new(SharedIdentity::new(Identity::new("first")));

        let running = spawn_loop(api.clone(), shared.clone(), 1, echo());
        tokio::time::sleep(Duration::from_millis(100)).await;
        shared.replace(Identity::new("second"));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        running.stop().await;

        let auth: Vec<Option<String>> = api
            .calls_for(Operation::FetchAndLock)
            .into_iter()
            .map(|c| c.authorization)
            .collect();
        assert_eq!(
            auth,
            vec![Some("Bearer first".to_string()), Some("Bearer second".to_string())]
        );
    }
}
