//! WorkerBuilder - ExternalTaskWorker の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 必須項目の欠落やタイミング設定の矛盾は `build()` で BuildError
//! - engine URL を渡せば HttpTaskApi、`api()` を渡せば任意の TaskApiPort（InMemoryTaskApi など）

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::config::WorkerConfig;
use super::worker::ExternalTaskWorker;
use crate::domain::{BuildError, Identity, WorkerId};
use crate::impls::http::HttpTaskApi;
use crate::ports::{IdentityProvider, TaskApiPort};
use crate::typed::{DynHandler, Handler, TypedHandler};

pub const DEFAULT_MAX_TASKS: u32 = 10;
pub const DEFAULT_LONG_POLLING_TIMEOUT: Duration = Duration::from_secs(10);

/// WorkerBuilder は ExternalTaskWorker を構築
///
/// # 使用例
/// ```ignore
/// let worker = ExternalTaskWorker::builder()
///     .engine_url("http://localhost:8000")
///     .identity(Identity::new(token))
///     .topic("billing")
///     .handler(ChargeHandler)
///     .build()?;
/// worker.run().await;
/// ```
pub struct WorkerBuilder {
    engine_url: Option<String>,
    api: Option<Arc<dyn TaskApiPort>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    topic: Option<String>,
    max_tasks: u32,
    long_polling_timeout: Duration,
    handler: Option<Arc<dyn DynHandler>>,
    worker_id: Option<WorkerId>,
    config: WorkerConfig,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self {
            engine_url: None,
            api: None,
            identity: None,
            topic: None,
            max_tasks: DEFAULT_MAX_TASKS,
            long_polling_timeout: DEFAULT_LONG_POLLING_TIMEOUT,
            handler: None,
            worker_id: None,
            config: WorkerConfig::default(),
        }
    }

    /// Talk to the engine over HTTP. Ignored when [`api`](Self::api) is set.
    pub fn engine_url(mut self, url: impl Into<String>) -> Self {
        self.engine_url = Some(url.into());
        self
    }

    /// Use an explicit accessor instead of HTTP.
    pub fn api(mut self, api: Arc<dyn TaskApiPort>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(Arc::new(identity));
        self
    }

    /// Resolve the identity once per fetch cycle (e.g. [`SharedIdentity`](crate::ports::SharedIdentity)).
    pub fn identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(provider);
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn max_tasks(mut self, max_tasks: u32) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub fn long_polling_timeout(mut self, timeout: Duration) -> Self {
        self.long_polling_timeout = timeout;
        self
    }

    /// Typed handler: payloads are decoded into `P`, results encoded from `R`.
    pub fn handler<P, R, H>(mut self, handler: H) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        H: Handler<P, R> + 'static,
    {
        self.handler = Some(Arc::new(TypedHandler::<P, R, H>::new(handler)));
        self
    }

    pub fn dyn_handler(mut self, handler: Arc<dyn DynHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Reuse a known worker id instead of generating one.
    pub fn worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ExternalTaskWorker, BuildError> {
        let topic = self.topic.ok_or(BuildError::MissingField("topic"))?;
        if topic.trim().is_empty() {
            return Err(BuildError::InvalidConfig("topic must not be empty".into()));
        }
        if self.max_tasks == 0 {
            return Err(BuildError::InvalidConfig("max_tasks must be at least 1".into()));
        }
        let identity = self.identity.ok_or(BuildError::MissingField("identity"))?;
        let handler = self.handler.ok_or(BuildError::MissingField("handler"))?;
        self.config.validate()?;

        let api = match (self.api, self.engine_url) {
            (Some(api), _) => api,
            (None, Some(url)) => {
                let http = HttpTaskApi::new(url)
                    .map_err(|e| BuildError::InvalidConfig(format!("http accessor: {e}")))?;
                Arc::new(http) as Arc<dyn TaskApiPort>
            }
            (None, None) => return Err(BuildError::MissingField("engine_url")),
        };

        let worker_id = self.worker_id.unwrap_or_else(WorkerId::generate);

        Ok(ExternalTaskWorker::new(
            api,
            identity,
            worker_id,
            topic,
            self.max_tasks,
            self.long_polling_timeout,
            handler,
            self.config,
        ))
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
