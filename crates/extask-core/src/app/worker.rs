//! ExternalTaskWorker - 1 topic を処理するワーカーの表層 API
//!
//! # 使い方は 2 通り
//! - `run()`: 呼び出し側の task で PollLoop を回す。止めるには先に `shutdown_handle()` を取っておく
//! - `start()`: PollLoop を spawn して `WorkerHandle` を返す
//!
//! stop は graceful: 新しい fetch をしなくなるだけで、処理中の batch は report まで完了させる。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::builder::WorkerBuilder;
use super::config::WorkerConfig;
use super::poll_loop::PollLoop;
use crate::domain::WorkerId;
use crate::ports::{IdentityProvider, TaskApiPort};
use crate::typed::DynHandler;

pub struct ExternalTaskWorker {
    poll: PollLoop,
    identity: Arc<dyn IdentityProvider>,
    topic: String,
    max_tasks: u32,
    long_polling_timeout: Duration,
    handler: Arc<dyn DynHandler>,
    shutdown: ShutdownHandle,
}

impl ExternalTaskWorker {
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        api: Arc<dyn TaskApiPort>,
        identity: Arc<dyn IdentityProvider>,
        worker_id: WorkerId,
        topic: String,
        max_tasks: u32,
        long_polling_timeout: Duration,
        handler: Arc<dyn DynHandler>,
        config: WorkerConfig,
    ) -> Self {
        let (tx, rx) = watch::channel(false);
        let poll = PollLoop::new(api, worker_id, config).with_shutdown(rx);
        Self {
            poll,
            identity,
            topic,
            max_tasks,
            long_polling_timeout,
            handler,
            shutdown: ShutdownHandle {
                tx: Arc::new(tx),
                polling: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.poll.worker_id()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn max_tasks(&self) -> u32 {
        self.max_tasks
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Poll until [`ShutdownHandle::stop`] is called.
    pub async fn run(&self) {
        let _polling = PollingFlag::raise(&self.shutdown.polling);
        self.poll
            .run(
                self.identity.as_ref(),
                &self.topic,
                self.max_tasks,
                self.long_polling_timeout,
                self.handler.clone(),
            )
            .await;
    }

    /// Spawn the poll loop on the current runtime.
    pub fn start(self) -> WorkerHandle {
        let worker_id = self.worker_id().clone();
        let shutdown = self.shutdown_handle();
        // start() 直後から is_polling() が true になるように先に立てる
        shutdown.polling.store(true, Ordering::Release);
        info!(worker_id = %worker_id, topic = %self.topic, "starting external task worker");

        let join = tokio::spawn(async move { self.run().await });
        WorkerHandle {
            worker_id,
            shutdown,
            join,
        }
    }
}

/// Stops a worker from any task. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
    polling: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Request a graceful stop. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }
}

/// Handle to a worker spawned by [`ExternalTaskWorker::start`].
pub struct WorkerHandle {
    worker_id: WorkerId,
    shutdown: ShutdownHandle,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn stop(&self) {
        self.shutdown.stop();
    }

    pub fn is_polling(&self) -> bool {
        self.shutdown.is_polling()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Wait for the poll loop to exit.
    pub async fn join(self) {
        if let Err(err) = self.join.await {
            warn!(worker_id = %self.worker_id, error = %err, "worker task ended abnormally");
        }
    }

    pub async fn stop_and_join(self) {
        self.stop();
        self.join().await;
    }
}

/// Clears the polling flag when the loop exits (including cancellation).
struct PollingFlag<'a>(&'a AtomicBool);

impl<'a> PollingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for PollingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
