//! ExternalTask - engine から fetch_and_lock で受け取る作業単位
//!
//! ワーカーから見ると immutable。lock の権利を持っている間だけ参照を保持し、
//! report が終わったら手放します。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ExternalTaskId;

/// A unit of work fetched and locked from the engine.
///
/// Besides `id`, `topic` and `payload`, the engine attaches metadata which the
/// worker passes through without interpreting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTask<P> {
    pub id: ExternalTaskId,
    pub topic: String,
    pub payload: P,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_node_instance_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_instance_id: Option<String>,

    /// Engine-owned; the worker never extends it locally, only via `extend_lock`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expiration_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl<P> ExternalTask<P> {
    pub fn new(id: impl Into<ExternalTaskId>, topic: impl Into<String>, payload: P) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            payload,
            worker_id: None,
            flow_node_instance_id: None,
            correlation_id: None,
            process_instance_id: None,
            lock_expiration_time: None,
            created_at: None,
        }
    }

    /// Swap the payload, keeping id and metadata.
    pub fn try_map_payload<Q, E>(
        self,
        f: impl FnOnce(P) -> Result<Q, E>,
    ) -> Result<ExternalTask<Q>, E> {
        Ok(ExternalTask {
            payload: f(self.payload)?,
            id: self.id,
            topic: self.topic,
            worker_id: self.worker_id,
            flow_node_instance_id: self.flow_node_instance_id,
            correlation_id: self.correlation_id,
            process_instance_id: self.process_instance_id,
            lock_expiration_time: self.lock_expiration_time,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_engine_shape() {
        let raw = json!({
            "id": "3f8d",
            "workerId": "worker-1",
            "topic": "billing",
            "flowNodeInstanceId": "fni-7",
            "correlationId": "corr-1",
            "processInstanceId": "pi-2",
            "lockExpirationTime": "2024-01-01T12:00:30Z",
            "payload": { "amount": 42 }
        });

        let task: ExternalTask<serde_json::Value> = serde_json::from_value(raw).unwrap();
        assert_eq!(task.id.as_str(), "3f8d");
        assert_eq!(task.topic, "billing");
        assert_eq!(task.payload["amount"], 42);
        assert_eq!(task.correlation_id.as_deref(), Some("corr-1"));
        assert!(task.lock_expiration_time.is_some());
        assert!(task.created_at.is_none());
    }

    #[test]
    fn missing_metadata_defaults_to_none() {
        let raw = json!({ "id": "a", "topic": "t", "payload": null });
        let task: ExternalTask<serde_json::Value> = serde_json::from_value(raw).unwrap();
        assert!(task.worker_id.is_none());
        assert!(task.flow_node_instance_id.is_none());
    }

    #[test]
    fn try_map_payload_keeps_metadata() {
        let mut task = ExternalTask::new("a", "t", json!({ "n": 1 }));
        task.correlation_id = Some("c".to_string());

        let mapped = task
            .try_map_payload(|v| serde_json::from_value::<std::collections::HashMap<String, i32>>(v))
            .unwrap();
        assert_eq!(mapped.payload["n"], 1);
        assert_eq!(mapped.correlation_id.as_deref(), Some("c"));
    }
}
