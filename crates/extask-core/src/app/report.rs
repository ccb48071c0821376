//! Report - TaskResult を engine への report 呼び出しに変換する
//!
//! | Variant      | 呼び出し             |
//! |--------------|----------------------|
//! | Success      | finish               |
//! | BpmnError    | handle_bpmn_error    |
//! | ServiceError | handle_service_error |
//!
//! report が失敗すると engine は lock が切れるまでタスクを握ったままになるので、
//! `RetryPolicy` に従って有限回リトライします。
//! 404 / 423 などの 4xx は lock を失った印なのでリトライしません。

use serde_json::Value;
use tracing::{error, warn};

use super::config::RetryPolicy;
use crate::domain::{ExternalTaskId, Identity, TaskApiError, TaskResult, WorkerId};
use crate::ports::TaskApiPort;

/// Issue the one report call that matches `result`.
pub async fn send_report(
    api: &dyn TaskApiPort,
    identity: &Identity,
    worker_id: &WorkerId,
    task_id: &ExternalTaskId,
    result: &TaskResult<Value>,
) -> Result<(), TaskApiError> {
    match result {
        TaskResult::Success { payload } => {
            api.finish(identity, worker_id, task_id, payload).await
        }
        TaskResult::BpmnError { error_code } => {
            api.handle_bpmn_error(identity, worker_id, task_id, error_code)
                .await
        }
        TaskResult::ServiceError { message, details } => {
            api.handle_service_error(identity, worker_id, task_id, message, details)
                .await
        }
    }
}

/// `send_report` with bounded retries. Returns the number of attempts made.
pub async fn report_with_retry(
    api: &dyn TaskApiPort,
    identity: &Identity,
    worker_id: &WorkerId,
    task_id: &ExternalTaskId,
    result: &TaskResult<Value>,
    policy: &RetryPolicy,
) -> Result<u32, TaskApiError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match send_report(api, identity, worker_id, task_id, result).await {
            Ok(()) => return Ok(attempts),
            Err(err) if err.is_retryable() && policy.should_retry(attempts) => {
                let delay = policy.next_delay(attempts);
                warn!(
                    %task_id,
                    kind = ?result.kind(),
                    attempt = attempts,
                    error = %err,
                    retry_in = ?delay,
                    "report failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(
                    %task_id,
                    kind = ?result.kind(),
                    attempts,
                    error = %err,
                    "report failed, giving up"
                );
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::memory::{ApiCall, InMemoryTaskApi, Operation};
    use rstest::rstest;
    use serde_json::json;
    use std::time::Duration;

    fn worker() -> WorkerId {
        WorkerId::new("worker-report")
    }

    async fn locked(api: &InMemoryTaskApi) -> ExternalTaskId {
        let task_id = api.enqueue("t", json!(null));
        api.fetch_and_lock(
            &Identity::anonymous(),
            &worker(),
            "t",
            1,
            Duration::ZERO,
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        task_id
    }

    #[rstest]
    #[case::success(TaskResult::success(json!({ "total": 3 })), Operation::Finish)]
    #[case::bpmn(TaskResult::bpmn_error("OUT_OF_STOCK"), Operation::HandleBpmnError)]
    #[case::service(TaskResult::service_error("boom", "trace"), Operation::HandleServiceError)]
    #[tokio::test]
    async fn each_variant_maps_to_one_call(
        #[case] result: TaskResult<Value>,
        #[case] expected: Operation,
    ) {
        let api = InMemoryTaskApi::new();
        let task_id = locked(&api).await;

        send_report(&api, &Identity::anonymous(), &worker(), &task_id, &result)
            .await
            .unwrap();

        let reports: Vec<_> = api
            .calls()
            .into_iter()
            .filter(|c| c.call.operation().is_report())
            .collect();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].call.operation(), expected);
        assert_eq!(reports[0].call.task_id(), Some(&task_id));
    }

    #[tokio::test]
    async fn arguments_are_passed_verbatim() {
        let api = InMemoryTaskApi::new();
        let task_id = locked(&api).await;

        send_report(
            &api,
            &Identity::anonymous(),
            &worker(),
            &task_id,
            &TaskResult::service_error("boom", "at line 3"),
        )
        .await
        .unwrap();

        let call = api.calls_for(Operation::HandleServiceError).remove(0).call;
        assert_eq!(
            call,
            ApiCall::HandleServiceError {
                worker_id: worker(),
                task_id,
                message: "boom".to_string(),
                details: "at line 3".to_string(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let api = InMemoryTaskApi::new();
        let task_id = locked(&api).await;
        api.fail_next(Operation::Finish, 2);

        let start = tokio::time::Instant::now();
        let attempts = report_with_retry(
            &api,
            &Identity::anonymous(),
            &worker(),
            &task_id,
            &TaskResult::success(json!(1)),
            &RetryPolicy::fixed(3, Duration::from_secs(1)),
        )
        .await
        .unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(api.count(Operation::Finish), 3);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_millis(2100));
        assert!(api.locked_tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let api = InMemoryTaskApi::new();
        let task_id = locked(&api).await;
        api.fail_next(Operation::HandleBpmnError, 10);

        let err = report_with_retry(
            &api,
            &Identity::anonymous(),
            &worker(),
            &task_id,
            &TaskResult::bpmn_error("E"),
            &RetryPolicy::fixed(3, Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TaskApiError::Transport(_)));
        assert_eq!(api.count(Operation::HandleBpmnError), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_report_is_not_retried() {
        let api = InMemoryTaskApi::new();
        // lock を取っていないタスク → engine は 404 を返す
        let task_id = ExternalTaskId::new("task-unlocked");

        let err = report_with_retry(
            &api,
            &Identity::anonymous(),
            &worker(),
            &task_id,
            &TaskResult::success(json!(1)),
            &RetryPolicy::fixed(3, Duration::from_secs(1)),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TaskApiError::Status { status: 404, .. }));
        assert_eq!(api.count(Operation::Finish), 1);
    }

    #[tokio::test]
    async fn no_retry_policy_tries_once() {
        let api = InMemoryTaskApi::new();
        let task_id = locked(&api).await;
        api.fail_next(Operation::Finish, 1);

        let result = report_with_retry(
            &api,
            &Identity::anonymous(),
            &worker(),
            &task_id,
            &TaskResult::success(json!(null)),
            &RetryPolicy::no_retry(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(api.count(Operation::Finish), 1);
    }
}
