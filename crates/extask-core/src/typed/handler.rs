//! Handler trait - ExternalTask を処理するユーザー関数の定義
//!
//! # 二層構造
//! - **表層（Typed）**: `Handler<P, R>` - payload `P` を受け取り `TaskResult<R>` を返す
//! - **内部（Dyn）**: `DynHandler` - JSON のまま扱う object-safe 版
//!
//! `TypedHandler<P, R, H>` が payload の decode と result の encode を担当し、
//! Handler を `Arc<dyn DynHandler>` に変換します（type erasure）。

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::{ExternalTask, HandlerError, TaskResult};

/// Handler は ExternalTask を処理して TaskResult を返す
///
/// # 使用例
/// ```ignore
/// struct ChargeHandler;
///
/// #[async_trait]
/// impl Handler<ChargeRequest, ChargeReceipt> for ChargeHandler {
///     async fn handle(
///         &self,
///         task: ExternalTask<ChargeRequest>,
///     ) -> Result<TaskResult<ChargeReceipt>, HandlerError> {
///         if task.payload.amount == 0 {
///             return Ok(TaskResult::bpmn_error("EMPTY_CHARGE"));
///         }
///         Ok(TaskResult::success(charge(&task.payload).await?))
///     }
/// }
/// ```
///
/// `Err(HandlerError)` は ServiceError として report されます。
#[async_trait]
pub trait Handler<P, R>: Send + Sync
where
    P: Send + 'static,
    R: Send + 'static,
{
    async fn handle(&self, task: ExternalTask<P>) -> Result<TaskResult<R>, HandlerError>;
}

/// DynHandler は object-safe な Handler の抽象化
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        task: ExternalTask<Value>,
    ) -> Result<TaskResult<Value>, HandlerError>;
}

pub struct TypedHandler<P, R, H> {
    handler: H,
    // fn(P) -> R にしておくと P, R が Send/Sync でなくても TypedHandler 自体は Send + Sync
    _marker: PhantomData<fn(P) -> R>,
}

impl<P, R, H> TypedHandler<P, R, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<P, R, H> DynHandler for TypedHandler<P, R, H>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    H: Handler<P, R>,
{
    async fn handle_dyn(
        &self,
        task: ExternalTask<Value>,
    ) -> Result<TaskResult<Value>, HandlerError> {
        let task = task.try_map_payload(|payload| {
            serde_json::from_value::<P>(payload)
                .map_err(|e| HandlerError::new(format!("payload decode: {e}")))
        })?;

        let result = self.handler.handle(task).await?;

        result.try_map(|payload| {
            serde_json::to_value(payload)
                .map_err(|e| HandlerError::new(format!("result encode: {e}")))
        })
    }
}

/// Closure-backed handler, see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`Handler`].
///
/// ```ignore
/// let handler = handler_fn(|task: ExternalTask<Order>| async move {
///     Ok::<_, HandlerError>(TaskResult::success(json!({ "shipped": task.payload.id })))
/// });
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler { f }
}

#[async_trait]
impl<P, R, F, Fut> Handler<P, R> for FnHandler<F>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(ExternalTask<P>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskResult<R>, HandlerError>> + Send,
{
    async fn handle(&self, task: ExternalTask<P>) -> Result<TaskResult<R>, HandlerError> {
        (self.f)(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Order {
        id: u32,
        quantity: u32,
    }

    #[derive(Debug, Serialize)]
    struct Shipment {
        order_id: u32,
    }

    struct ShipHandler;

    #[async_trait]
    impl Handler<Order, Shipment> for ShipHandler {
        async fn handle(
            &self,
            task: ExternalTask<Order>,
        ) -> Result<TaskResult<Shipment>, HandlerError> {
            if task.payload.quantity == 0 {
                return Ok(TaskResult::bpmn_error("EMPTY_ORDER"));
            }
            Ok(TaskResult::success(Shipment {
                order_id: task.payload.id,
            }))
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload_and_encodes_result() {
        let handler = TypedHandler::<Order, Shipment, _>::new(ShipHandler);
        let task = ExternalTask::new("t-1", "shipping", json!({ "id": 7, "quantity": 2 }));

        let result = handler.handle_dyn(task).await.unwrap();
        assert_eq!(result, TaskResult::success(json!({ "order_id": 7 })));
    }

    #[tokio::test]
    async fn typed_handler_passes_error_variants_through() {
        let handler = TypedHandler::<Order, Shipment, _>::new(ShipHandler);
        let task = ExternalTask::new("t-1", "shipping", json!({ "id": 7, "quantity": 0 }));

        let result = handler.handle_dyn(task).await.unwrap();
        assert_eq!(result, TaskResult::bpmn_error("EMPTY_ORDER"));
    }

    #[tokio::test]
    async fn undecodable_payload_becomes_handler_error() {
        let handler = TypedHandler::<Order, Shipment, _>::new(ShipHandler);
        let task = ExternalTask::new("t-1", "shipping", json!({ "id": "seven" }));

        let err = handler.handle_dyn(task).await.unwrap_err();
        assert!(err.message().starts_with("payload decode:"));
    }

    #[tokio::test]
    async fn handler_fn_wraps_closures() {
        let handler = TypedHandler::<Value, Value, _>::new(handler_fn(
            |task: ExternalTask<Value>| async move {
                Ok::<_, HandlerError>(TaskResult::success(json!({ "echo": task.payload })))
            },
        ));

        let result = handler
            .handle_dyn(ExternalTask::new("t-2", "echo", json!(1)))
            .await
            .unwrap();
        assert_eq!(result, TaskResult::success(json!({ "echo": 1 })));
    }
}
