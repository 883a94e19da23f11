//! Wire and runtime types shared between the server and workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Workflow lifecycle state. `Success`, `Failed` and `Timeout` are
/// terminal: no further transitions are accepted once reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Pending => "PENDING",
            WorkflowState::Running => "RUNNING",
            WorkflowState::Success => "SUCCESS",
            WorkflowState::Failed => "FAILED",
            WorkflowState::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(WorkflowState::Pending),
            "RUNNING" => Some(WorkflowState::Running),
            "SUCCESS" => Some(WorkflowState::Success),
            "FAILED" => Some(WorkflowState::Failed),
            "TIMEOUT" => Some(WorkflowState::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Success | WorkflowState::Failed | WorkflowState::Timeout
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single action within a workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
}

impl ActionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::Pending => "PENDING",
            ActionState::Running => "RUNNING",
            ActionState::Success => "SUCCESS",
            ActionState::Failed => "FAILED",
            ActionState::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ActionState::Pending),
            "RUNNING" => Some(ActionState::Running),
            "SUCCESS" => Some(ActionState::Success),
            "FAILED" => Some(ActionState::Failed),
            "TIMEOUT" => Some(ActionState::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task of the rendered, hardware-bound plan. Task-level volumes and
/// environment have already been folded into the contained actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanTask {
    pub name: String,
    pub worker_addr: String,
    pub actions: Vec<PlanAction>,
}

/// A fully-grounded action as a worker executes it. `timeout` of zero
/// means no per-action timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanAction {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_timeout: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<String>,
}

/// Runtime record of a workflow, as returned by GetWorkflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub template_id: Uuid,
    pub hardware_id: String,
    pub state: WorkflowState,
    pub current_worker: String,
    pub current_task: String,
    pub current_action: String,
    pub current_action_state: ActionState,
    pub current_action_index: i64,
    pub total_number_of_actions: i64,
    pub data_version: i64,
    pub rendered_yaml: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Dispatch view of a workflow: where the cursor is right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_id: Uuid,
    pub current_worker: String,
    pub current_task: String,
    pub current_action: String,
    pub current_action_index: i64,
    pub current_action_state: ActionState,
    pub total_number_of_actions: i64,
}

/// One entry of the ordered action list a worker fetches once and then
/// executes in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowActionEntry {
    pub task_name: String,
    pub worker_addr: String,
    pub task_index: usize,
    pub action_index: usize,
    #[serde(flatten)]
    pub action: PlanAction,
}

/// An action-status report posted by a worker (or self-generated by the
/// timeout sweep). The cursor fields must match the server's current
/// cursor or the report is rejected as out of order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionReport {
    pub worker_id: String,
    pub task_name: String,
    pub action_name: String,
    pub action_status: ActionState,
    #[serde(default)]
    pub seconds: i64,
    #[serde(default)]
    pub message: String,
    pub task_index: usize,
    pub action_index: usize,
}

/// Append-only event log entry. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub workflow_id: Uuid,
    pub worker_id: String,
    pub task_name: String,
    pub action_name: String,
    pub action_status: ActionState,
    pub seconds: i64,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Stored template record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub data: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Stored hardware record: a stable ID plus an opaque JSON document the
/// owner shaped. MACs and IPs are extracted from the document for lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hardware {
    pub id: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            WorkflowState::Pending,
            WorkflowState::Running,
            WorkflowState::Success,
            WorkflowState::Failed,
            WorkflowState::Timeout,
        ] {
            assert_eq!(WorkflowState::parse(state.as_str()), Some(state));
        }
        assert_eq!(WorkflowState::parse("BOGUS"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!WorkflowState::Pending.is_terminal());
        assert!(!WorkflowState::Running.is_terminal());
        assert!(WorkflowState::Success.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(WorkflowState::Timeout.is_terminal());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&WorkflowState::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
        let json = serde_json::to_string(&ActionState::Success).unwrap();
        assert_eq!(json, "\"SUCCESS\"");
    }

    #[test]
    fn test_action_entry_flattens_action_fields() {
        let entry = WorkflowActionEntry {
            task_name: "install".into(),
            worker_addr: "aa:bb:cc:00:11:22".into(),
            task_index: 0,
            action_index: 1,
            action: PlanAction {
                name: "stream-image".into(),
                image: "quay.io/anvil/image2disk:v1".into(),
                timeout: 600,
                command: vec![],
                volumes: vec!["/dev:/dev".into()],
                environment: BTreeMap::new(),
                pid: None,
                on_timeout: vec![],
                on_failure: vec![],
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["name"], "stream-image");
        assert_eq!(json["task_name"], "install");
    }
}
