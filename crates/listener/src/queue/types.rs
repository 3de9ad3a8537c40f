//! Queue data types
//!
//! These mirror the JSON the queue returns (camelCase field names).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One run of a task as reported in its status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub run_id: u32,

    /// Run state (`pending`, `running`, `completed`, `failed`, `exception`)
    pub state: String,

    /// Why the run was resolved, once it is (e.g. `canceled`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_resolved: Option<String>,
}

/// Task status with its run history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: String,

    #[serde(default)]
    pub runs: Vec<RunInfo>,
}

impl TaskStatus {
    /// Reason the given run was resolved with, if any
    pub fn reason_resolved(&self, run_id: u32) -> Option<&str> {
        self.runs
            .iter()
            .find(|run| run.run_id == run_id)
            .and_then(|run| run.reason_resolved.as_deref())
    }
}

/// Result of a successful claim: the right to execute one run of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub status: TaskStatus,
    pub run_id: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taken_until: Option<DateTime<Utc>>,
}

impl Claim {
    /// Claim on `run_id` of `task_id` whose status lists only that run
    pub fn new(task_id: impl Into<String>, run_id: u32) -> Self {
        Self {
            status: TaskStatus {
                task_id: task_id.into(),
                runs: vec![RunInfo {
                    run_id,
                    state: "running".to_string(),
                    reason_resolved: None,
                }],
            },
            run_id,
            taken_until: None,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.status.task_id
    }

    /// Whether this claim is the task's first run
    pub fn is_first_run(&self) -> bool {
        self.run_id == 0
    }
}

/// Capabilities a task requests from the worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Requested devices keyed by device name (`loopbackVideo`, ...)
    #[serde(default)]
    pub devices: BTreeMap<String, serde_json::Value>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Task payload; only the parts this worker core inspects are typed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Full task definition fetched from the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// When the task was created; used for queue-latency measurement
    pub created: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,

    #[serde(default)]
    pub payload: TaskPayload,
}

impl TaskDefinition {
    /// Definition created now with an empty payload
    pub fn new() -> Self {
        Self {
            created: Utc::now(),
            deadline: None,
            payload: TaskPayload::default(),
        }
    }

    /// Request a device capability
    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        self.payload
            .capabilities
            .get_or_insert_with(Capabilities::default)
            .devices
            .insert(name.into(), serde_json::Value::Bool(true));
        self
    }

    /// Names of the devices listed in `payload.capabilities.devices`
    pub fn requested_devices(&self) -> impl Iterator<Item = &str> {
        self.payload
            .capabilities
            .iter()
            .flat_map(|caps| caps.devices.keys())
            .map(String::as_str)
    }
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_claim_from_queue_json() {
        let claim: Claim = serde_json::from_value(json!({
            "status": {
                "taskId": "abc",
                "runs": [{"runId": 0, "state": "running"}]
            },
            "runId": 0,
            "takenUntil": "2026-01-01T00:20:00Z"
        }))
        .unwrap();

        assert_eq!(claim.task_id(), "abc");
        assert!(claim.is_first_run());
        assert!(claim.taken_until.is_some());
    }

    #[test]
    fn test_claim_new_lists_only_its_run() {
        let claim = Claim::new("abc", u32::MAX);
        assert_eq!(claim.status.runs.len(), 1);
        assert!(!claim.is_first_run());
        assert_eq!(claim.status.runs[0].run_id, u32::MAX);
        assert_eq!(claim.status.runs[0].state, "running");
        assert_eq!(claim.status.reason_resolved(u32::MAX), None);
    }

    #[test]
    fn test_requested_devices_from_payload() {
        let task: TaskDefinition = serde_json::from_value(json!({
            "created": "2026-01-01T00:00:00Z",
            "payload": {
                "image": "ubuntu:24.04",
                "capabilities": {
                    "privileged": false,
                    "devices": {"loopbackVideo": true, "loopbackAudio": true}
                }
            }
        }))
        .unwrap();

        let devices: Vec<&str> = task.requested_devices().collect();
        assert_eq!(devices, vec!["loopbackAudio", "loopbackVideo"]);
        assert_eq!(task.payload.extra["image"], "ubuntu:24.04");
    }

    #[test]
    fn test_no_capabilities() {
        let task: TaskDefinition = serde_json::from_value(json!({
            "created": "2026-01-01T00:00:00Z",
            "payload": {"command": ["true"]}
        }))
        .unwrap();

        assert_eq!(task.requested_devices().count(), 0);
    }

    #[test]
    fn test_reason_resolved_lookup() {
        let status = TaskStatus {
            task_id: "abc".into(),
            runs: vec![RunInfo {
                run_id: 0,
                state: "exception".into(),
                reason_resolved: Some("canceled".into()),
            }],
        };

        assert_eq!(status.reason_resolved(0), Some("canceled"));
        assert_eq!(status.reason_resolved(1), None);
    }
}
