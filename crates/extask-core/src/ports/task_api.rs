//! TaskApiPort port - engine の External Task API
//!
//! ワーカーの orchestration core が依存するのはこの trait だけです。
//!
//! # 実装
//! - **HttpTaskApi**: `api/external_task/v1` への HTTP accessor（本番用）
//! - **InMemoryTaskApi**: 呼び出しを記録する fake engine（テスト・dry-run 用）

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{ExternalTask, ExternalTaskId, Identity, TaskApiError, WorkerId};

/// The five remote operations of the external task API.
///
/// Every call carries its own identity; implementations must not keep
/// per-identity state on a shared client. Implementations are shared between
/// all in-flight tasks and their lock renewers, so they must be safe for
/// concurrent use.
#[async_trait]
pub trait TaskApiPort: Send + Sync {
    /// Fetch up to `max_tasks` tasks for `topic` and lock them for `lock_duration`.
    ///
    /// May block up to `long_polling_timeout` and returns an empty batch when
    /// nothing became available in that time.
    async fn fetch_and_lock(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        topic: &str,
        max_tasks: u32,
        long_polling_timeout: Duration,
        lock_duration: Duration,
    ) -> Result<Vec<ExternalTask<serde_json::Value>>, TaskApiError>;

    async fn extend_lock(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        task_id: &ExternalTaskId,
        additional_duration: Duration,
    ) -> Result<(), TaskApiError>;

    async fn finish(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        task_id: &ExternalTaskId,
        result: &serde_json::Value,
    ) -> Result<(), TaskApiError>;

    /// Report a business (BPMN) error.
    async fn handle_bpmn_error(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        task_id: &ExternalTaskId,
        error_code: &str,
    ) -> Result<(), TaskApiError>;

    /// Report a technical (service) error.
    async fn handle_service_error(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        task_id: &ExternalTaskId,
        message: &str,
        details: &str,
    ) -> Result<(), TaskApiError>;
}
