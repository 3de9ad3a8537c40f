//! Task-exception messages and the cancellation events derived from them

use serde::{Deserialize, Serialize};

use crate::config::WorkerIdentity;
use crate::queue::TaskStatus;
use crate::registry::RunKey;

/// Exchange the queue publishes task exceptions on
pub const TASK_EXCEPTION_EXCHANGE: &str = "exchange/taskcluster-queue/v1/task-exception";

/// `reasonResolved` value of a run canceled through the queue
pub const CANCELED: &str = "canceled";

/// Subscription filter for task exceptions on runs held by this worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionBinding {
    pub worker_id: String,
    pub worker_type: String,
    pub worker_group: String,
    pub provisioner_id: String,
}

impl ExceptionBinding {
    pub fn exchange(&self) -> &'static str {
        TASK_EXCEPTION_EXCHANGE
    }

    /// Routing-key pattern matching exceptions for this worker
    ///
    /// Key layout: `primary.<taskId>.<runId>.<workerGroup>.<workerId>.
    /// <provisionerId>.<workerType>.<schedulerId>.<taskGroupId>.#`
    pub fn routing_key_pattern(&self) -> String {
        format!(
            "primary.*.*.{}.{}.{}.{}.*.*.#",
            self.worker_group, self.worker_id, self.provisioner_id, self.worker_type
        )
    }
}

impl From<&WorkerIdentity> for ExceptionBinding {
    fn from(identity: &WorkerIdentity) -> Self {
        Self {
            worker_id: identity.worker_id.clone(),
            worker_type: identity.worker_type.clone(),
            worker_group: identity.worker_group.clone(),
            provisioner_id: identity.provisioner_id.clone(),
        }
    }
}

/// Payload of a task-exception message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExceptionPayload {
    pub status: TaskStatus,
    pub run_id: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// Message delivered by the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExceptionMessage {
    #[serde(default)]
    pub exchange: String,

    #[serde(default)]
    pub routing_key: String,

    pub payload: TaskExceptionPayload,
}

/// A resolved run the listener may have to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationEvent {
    pub task_id: String,
    pub run_id: u32,
    pub reason_resolved: Option<String>,
}

impl CancellationEvent {
    /// Extract the event; `None` when the message's run is not in its status
    pub fn from_message(message: &TaskExceptionMessage) -> Option<Self> {
        let payload = &message.payload;
        let run = payload
            .status
            .runs
            .iter()
            .find(|run| run.run_id == payload.run_id)?;

        Some(Self {
            task_id: payload.status.task_id.clone(),
            run_id: payload.run_id,
            reason_resolved: run.reason_resolved.clone(),
        })
    }

    /// Only `canceled` resolutions stop a running task
    pub fn is_cancellation(&self) -> bool {
        self.reason_resolved.as_deref() == Some(CANCELED)
    }

    pub fn key(&self) -> RunKey {
        RunKey::new(self.task_id.clone(), self.run_id)
    }
}

impl TaskExceptionMessage {
    /// Message resolving `run_id` of `task_id` with `reason`
    pub fn resolved(task_id: &str, run_id: u32, reason: &str) -> Self {
        Self {
            exchange: TASK_EXCEPTION_EXCHANGE.to_string(),
            routing_key: String::new(),
            payload: TaskExceptionPayload {
                status: TaskStatus {
                    task_id: task_id.to_string(),
                    runs: vec![crate::queue::RunInfo {
                        run_id,
                        state: "exception".to_string(),
                        reason_resolved: Some(reason.to_string()),
                    }],
                },
                run_id,
                worker_group: None,
                worker_id: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_routing_key_pattern() {
        let binding = ExceptionBinding {
            worker_id: "i-123".into(),
            worker_type: "builder".into(),
            worker_group: "us-east-1".into(),
            provisioner_id: "aws".into(),
        };

        assert_eq!(
            binding.routing_key_pattern(),
            "primary.*.*.us-east-1.i-123.aws.builder.*.*.#"
        );
        assert_eq!(binding.exchange(), TASK_EXCEPTION_EXCHANGE);
    }

    #[test]
    fn test_event_from_bus_json() {
        let message: TaskExceptionMessage = serde_json::from_value(json!({
            "exchange": TASK_EXCEPTION_EXCHANGE,
            "routingKey": "primary.abc.1.g.w.p.t.s.tg._",
            "payload": {
                "status": {
                    "taskId": "abc",
                    "runs": [
                        {"runId": 0, "state": "exception", "reasonResolved": "worker-shutdown"},
                        {"runId": 1, "state": "exception", "reasonResolved": "canceled"}
                    ]
                },
                "runId": 1,
                "workerGroup": "g",
                "workerId": "w"
            }
        }))
        .unwrap();

        let event = CancellationEvent::from_message(&message).unwrap();
        assert_eq!(event.task_id, "abc");
        assert_eq!(event.run_id, 1);
        assert!(event.is_cancellation());
        assert_eq!(event.key(), RunKey::new("abc", 1));
    }

    #[test]
    fn test_other_reasons_are_not_cancellations() {
        let message = TaskExceptionMessage::resolved("abc", 0, "deadline-exceeded");
        let event = CancellationEvent::from_message(&message).unwrap();
        assert!(!event.is_cancellation());
    }

    #[test]
    fn test_resolved_lists_only_its_run() {
        let message = TaskExceptionMessage::resolved("abc", u32::MAX, CANCELED);
        assert_eq!(message.payload.status.runs.len(), 1);

        let event = CancellationEvent::from_message(&message).unwrap();
        assert_eq!(event.run_id, u32::MAX);
        assert!(event.is_cancellation());
    }

    #[test]
    fn test_missing_run_yields_no_event() {
        let mut message = TaskExceptionMessage::resolved("abc", 0, CANCELED);
        message.payload.run_id = 4;
        assert!(CancellationEvent::from_message(&message).is_none());
    }
}
