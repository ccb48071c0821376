//! TaskResult: the outcome of processing one external task.
//!
//! This is a proper tagged union. Each variant maps to exactly one report call
//! (see `app::report`), so the worker never has to probe the result's type at
//! runtime.

use serde::{Deserialize, Serialize};

/// Which report call a result ends up in. Handy for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultKind {
    Success,
    BpmnError,
    ServiceError,
}

/// Outcome of a processing attempt.
///
/// - `Success`: finish the task with `payload` as its result.
/// - `BpmnError`: an expected, modelled business failure identified by `error_code`.
/// - `ServiceError`: an unexpected technical failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskResult<R> {
    Success { payload: R },
    BpmnError { error_code: String },
    ServiceError { message: String, details: String },
}

impl<R> TaskResult<R> {
    pub fn success(payload: R) -> Self {
        Self::Success { payload }
    }

    pub fn bpmn_error(error_code: impl Into<String>) -> Self {
        Self::BpmnError {
            error_code: error_code.into(),
        }
    }

    pub fn service_error(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ServiceError {
            message: message.into(),
            details: details.into(),
        }
    }

    pub fn kind(&self) -> ResultKind {
        match self {
            Self::Success { .. } => ResultKind::Success,
            Self::BpmnError { .. } => ResultKind::BpmnError,
            Self::ServiceError { .. } => ResultKind::ServiceError,
        }
    }

    /// Convert the success payload; error variants pass through unchanged.
    pub fn try_map<Q, E>(self, f: impl FnOnce(R) -> Result<Q, E>) -> Result<TaskResult<Q>, E> {
        Ok(match self {
            Self::Success { payload } => TaskResult::Success {
                payload: f(payload)?,
            },
            Self::BpmnError { error_code } => TaskResult::BpmnError { error_code },
            Self::ServiceError { message, details } => {
                TaskResult::ServiceError { message, details }
            }
        })
    }
}
