//! Errors - エラー型と分類
//!
//! # 分類
//! - **TaskApiError**: engine との通信エラー（fetch / extend / report）
//! - **HandlerError**: ユーザーの処理関数が返す失敗。ServiceError として report される
//! - **BuildError**: ワーカー構築時の検証エラー（Fail-fast）
//! - **ConfigError**: 環境変数からの設定読み込みエラー

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// Failure of a call through `TaskApiPort`.
#[derive(Debug, Error)]
pub enum TaskApiError {
    #[error("engine responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode engine response: {0}")]
    Decode(String),
}

impl TaskApiError {
    /// Whether repeating the same call may succeed.
    ///
    /// 4xx means the engine rejected the call itself (e.g. 404 / 423: the task
    /// is no longer locked by this worker); only 408 and 429 are worth repeating.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => !(400..500).contains(status) || matches!(status, 408 | 429),
            Self::Transport(_) | Self::Decode(_) => true,
        }
    }
}

/// Failure raised by a task handler.
///
/// Reported to the engine as a service error with `message` and `details`.
/// Any `std::error::Error` converts into it with `?`; the source chain becomes
/// the details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    message: String,
    details: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: String::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn into_parts(self) -> (String, String) {
        (self.message, self.details)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// HandlerError は std::error::Error を実装しない（実装すると From<T> for T と衝突する）
impl<E: StdError> From<E> for HandlerError {
    fn from(err: E) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            details: causes.join("\n"),
        }
    }
}

/// BuildError はワーカー構築時のエラー
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {name} has invalid value {value:?}: expected {expected}")]
    InvalidValue {
        name: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error(transparent)]
    Build(#[from] BuildError),
}
