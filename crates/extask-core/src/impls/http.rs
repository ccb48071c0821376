//! HttpTaskApi - engine の `api/external_task/v1` への HTTP accessor
//!
//! # 実装詳細
//! - `reqwest::Client` を 1 つ共有し、Authorization ヘッダはリクエストごとに付ける
//!   （anonymous identity のときは付けない）
//! - body は camelCase、duration はミリ秒
//! - fetch_and_lock の timeout は `long_polling_timeout + long_poll_margin`（long poll を途中で切らない）
//! - 2xx 以外は `TaskApiError::Status`。report 系のレスポンス body は読まない

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response, Url};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::domain::{ExternalTask, ExternalTaskId, Identity, TaskApiError, WorkerId};
use crate::ports::TaskApiPort;

pub const API_BASE_PATH: &str = "api/external_task/v1";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LONG_POLL_MARGIN: Duration = Duration::from_secs(5);

impl From<reqwest::Error> for TaskApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TaskApiError::Decode(err.to_string())
        } else {
            TaskApiError::Transport(err.to_string())
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchAndLockRequest<'a> {
    worker_id: &'a str,
    topic_name: &'a str,
    max_tasks: u32,
    long_polling_timeout: u64,
    lock_duration: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtendLockRequest<'a> {
    worker_id: &'a str,
    additional_duration: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishRequest<'a> {
    worker_id: &'a str,
    result: &'a Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BpmnErrorRequest<'a> {
    worker_id: &'a str,
    error_code: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceErrorRequest<'a> {
    worker_id: &'a str,
    error_message: &'a str,
    error_details: &'a str,
}

/// HTTP implementation of [`TaskApiPort`].
#[derive(Debug, Clone)]
pub struct HttpTaskApi {
    base_url: Url,
    client: Client,
    request_timeout: Duration,
    long_poll_margin: Duration,
}

impl HttpTaskApi {
    /// `engine_url` is the engine root, e.g. `http://localhost:8000`.
    pub fn new(engine_url: impl Into<String>) -> Result<Self, TaskApiError> {
        let client = Client::builder().build()?;
        Self::with_client(engine_url, client)
    }

    pub fn with_client(engine_url: impl Into<String>, client: Client) -> Result<Self, TaskApiError> {
        let engine_url = engine_url.into();
        let raw = format!("{}/{API_BASE_PATH}", engine_url.trim_end_matches('/'));
        let base_url = Url::parse(&raw)
            .map_err(|e| TaskApiError::Transport(format!("invalid engine url {engine_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(TaskApiError::Transport(format!(
                "engine url {engine_url:?} cannot be a base"
            )));
        }
        Ok(Self {
            base_url,
            client,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            long_poll_margin: DEFAULT_LONG_POLL_MARGIN,
        })
    }

    /// Timeout for every call except fetch_and_lock.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Extra time granted to fetch_and_lock on top of the long polling timeout.
    pub fn with_long_poll_margin(mut self, margin: Duration) -> Self {
        self.long_poll_margin = margin;
        self
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Base URL plus `segments`, each percent-encoded as a single path segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // with_client で cannot-be-a-base は弾いているので Err にはならない
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        identity: &Identity,
        segments: &[&str],
        body: &B,
        timeout: Duration,
    ) -> Result<Response, TaskApiError> {
        let url = self.endpoint(segments);
        let mut request = self.client.post(url.clone()).json(body).timeout(timeout);
        if let Some(bearer) = identity.bearer_header() {
            request = request.header(AUTHORIZATION, bearer);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(%url, status = status.as_u16(), "engine responded");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TaskApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn task_path<'a>(task_id: &'a ExternalTaskId, action: &'a str) -> [&'a str; 3] {
    ["task", task_id.as_str(), action]
}

#[async_trait]
impl TaskApiPort for HttpTaskApi {
    async fn fetch_and_lock(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        topic: &str,
        max_tasks: u32,
        long_polling_timeout: Duration,
        lock_duration: Duration,
    ) -> Result<Vec<ExternalTask<Value>>, TaskApiError> {
        let body = FetchAndLockRequest {
            worker_id: worker_id.as_str(),
            topic_name: topic,
            max_tasks,
            long_polling_timeout: millis(long_polling_timeout),
            lock_duration: millis(lock_duration),
        };
        let timeout = long_polling_timeout.saturating_add(self.long_poll_margin);

        let response = self.post(identity, &["fetch_and_lock"], &body, timeout).await?;
        Ok(response.json::<Vec<ExternalTask<Value>>>().await?)
    }

    async fn extend_lock(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        task_id: &ExternalTaskId,
        additional_duration: Duration,
    ) -> Result<(), TaskApiError> {
        let body = ExtendLockRequest {
            worker_id: worker_id.as_str(),
            additional_duration: millis(additional_duration),
        };
        self.post(
            identity,
            &task_path(task_id, "extend_lock"),
            &body,
            self.request_timeout,
        )
        .await?;
        Ok(())
    }

    async fn finish(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        task_id: &ExternalTaskId,
        result: &Value,
    ) -> Result<(), TaskApiError> {
        let body = FinishRequest {
            worker_id: worker_id.as_str(),
            result,
        };
        self.post(
            identity,
            &task_path(task_id, "finish"),
            &body,
            self.request_timeout,
        )
        .await?;
        Ok(())
    }

    async fn handle_bpmn_error(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        task_id: &ExternalTaskId,
        error_code: &str,
    ) -> Result<(), TaskApiError> {
        let body = BpmnErrorRequest {
            worker_id: worker_id.as_str(),
            error_code,
        };
        self.post(
            identity,
            &task_path(task_id, "handle_bpmn_error"),
            &body,
            self.request_timeout,
        )
        .await?;
        Ok(())
    }

    async fn handle_service_error(
        &self,
        identity: &Identity,
        worker_id: &WorkerId,
        task_id: &ExternalTaskId,
        message: &str,
        details: &str,
    ) -> Result<(), TaskApiError> {
        let body = ServiceErrorRequest {
            worker_id: worker_id.as_str(),
            error_message: message,
            error_details: details,
        };
        self.post(
            identity,
            &task_path(task_id, "handle_service_error"),
            &body,
            self.request_timeout,
        )
        .await?;
        Ok(())
    }
}
