//! extask-core
//!
//! Client-side worker for a workflow engine's external task API.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, identity, task, result, errors）
//! - **ports**: 抽象化レイヤー（TaskApiPort, IdentityProvider）
//! - **app**: ワーカーの振る舞い（builder, worker, poll_loop, dispatcher, lock_renewer, report, config）
//! - **typed**: 型付き Handler API（Handler trait, TypedHandler, handler_fn）
//! - **impls**: 実装（HttpTaskApi, InMemoryTaskApi）
//!
//! # 使用例
//! ```ignore
//! let handle = ExternalTaskWorker::builder()
//!     .engine_url("http://localhost:8000")
//!     .identity(Identity::new(token))
//!     .topic("billing")
//!     .handler(handler_fn(|task: ExternalTask<Invoice>| async move {
//!         Ok::<_, HandlerError>(TaskResult::success(charge(task.payload).await?))
//!     }))
//!     .build()?
//!     .start();
//! // ...
//! handle.stop_and_join().await;
//! ```

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{
    ExternalTaskWorker, RetryPolicy, ShutdownHandle, WorkerBuilder, WorkerConfig, WorkerHandle,
};
pub use domain::{
    BuildError, ConfigError, ExternalTask, ExternalTaskId, HandlerError, Identity, TaskApiError,
    TaskResult, WorkerId,
};
pub use impls::{HttpTaskApi, InMemoryTaskApi};
pub use ports::{IdentityProvider, SharedIdentity, TaskApiPort};
pub use typed::{DynHandler, Handler, handler_fn};
