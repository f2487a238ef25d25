//! Consensus operations and the replicated task records they produce.
//!
//! An [`Operation`] is a candidate state change; once DECIDED it is applied
//! to the replicated store exactly once per node. Task records live under
//! `tasks/<task_id>` and advance strictly forward through
//! `assigned -> running -> completed|failed`; the only sanctioned exception
//! is a FAIL_NODE reassignment, which restarts the record at `assigned` on a
//! new owner.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Store key for a task record.
pub fn task_key(task_id: &str) -> String {
    format!("tasks/{}", task_id)
}

/// A candidate state change proposed to consensus.
///
/// `op_id` is globally unique; once decided the operation is immutable.
/// On the wire the body serializes as a `type` tag plus a `details` object
/// next to the header fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub op_id: Uuid,
    pub proposer: String,
    /// Unix milliseconds stamped by the proposer.
    pub timestamp: u64,
    #[serde(flatten)]
    pub body: OpBody,
}

impl Operation {
    pub fn new(proposer: String, timestamp: u64, body: OpBody) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            proposer,
            timestamp,
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "details")]
pub enum OpBody {
    #[serde(rename = "ASSIGN_TASK")]
    AssignTask(AssignTask),

    #[serde(rename = "FAIL_NODE")]
    FailNode(FailNode),

    #[serde(rename = "UPDATE_TASK_STATUS")]
    UpdateTaskStatus(UpdateTaskStatus),
}

/// Assign a container task to a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignTask {
    pub task_id: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub assigned_node: String,
}

/// Declare a node failed and move its open tasks to new owners.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailNode {
    pub failed_node_id: String,
    pub reassignments: Vec<Reassignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reassignment {
    pub task_id: String,
    pub new_node: String,
}

/// Carry a worker outcome (or launch) through consensus. Keeping status
/// mutations on the decided path means the store never takes direct writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateTaskStatus {
    pub task_id: String,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Assigned => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    /// Whether a plain status mutation from `self` to `next` moves forward.
    /// Terminal states accept nothing; skipping `running` is forward and
    /// therefore allowed (a worker that dies before launch reports `failed`
    /// straight from `assigned`).
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Replicated record for one task, stored at `tasks/<task_id>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub assigned_node: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl TaskRecord {
    /// Fresh record for a newly decided assignment.
    pub fn assigned(assign: &AssignTask, created_at: u64) -> Self {
        Self {
            status: TaskStatus::Assigned,
            assigned_node: assign.assigned_node.clone(),
            image: assign.image.clone(),
            cmd: assign.cmd.clone(),
            created_at,
            completed_at: None,
            exit_code: None,
        }
    }

    /// A task still owed work by its assigned node.
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Restart this record at `assigned` on a new owner. Used only when a
    /// decided FAIL_NODE moves work off a dead node; the status monotonicity
    /// rule applies to everything else.
    pub fn reassigned_to(&self, new_node: &str, at: u64) -> Self {
        Self {
            status: TaskStatus::Assigned,
            assigned_node: new_node.to_string(),
            image: self.image.clone(),
            cmd: self.cmd.clone(),
            created_at: at,
            completed_at: None,
            exit_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_forward_only() {
        use TaskStatus::*;

        assert!(Assigned.can_advance_to(Running));
        assert!(Running.can_advance_to(Completed));
        assert!(Running.can_advance_to(Failed));
        assert!(Assigned.can_advance_to(Failed));

        assert!(!Running.can_advance_to(Assigned));
        assert!(!Completed.can_advance_to(Running));
        assert!(!Failed.can_advance_to(Completed));
        assert!(!Assigned.can_advance_to(Assigned));
    }

    #[test]
    fn test_operation_wire_shape() {
        let op = Operation::new(
            "node-1".into(),
            7,
            OpBody::AssignTask(AssignTask {
                task_id: "t1".into(),
                image: "alpine".into(),
                cmd: vec!["echo".into(), "hi".into()],
                assigned_node: "node-1".into(),
            }),
        );

        let json = serde_json::to_value(&op).expect("serialize");
        assert_eq!(json["type"], "ASSIGN_TASK");
        assert_eq!(json["details"]["task_id"], "t1");
        assert_eq!(json["proposer"], "node-1");

        let back: Operation = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, op);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let v = serde_json::to_value(TaskStatus::Completed).expect("serialize");
        assert_eq!(v, "completed");
    }

    #[test]
    fn test_reassignment_resets_record() {
        let rec = TaskRecord {
            status: TaskStatus::Running,
            assigned_node: "node-b".into(),
            image: "alpine".into(),
            cmd: vec!["sleep".into(), "60".into()],
            created_at: 1,
            completed_at: None,
            exit_code: None,
        };

        let moved = rec.reassigned_to("node-c", 9);
        assert_eq!(moved.status, TaskStatus::Assigned);
        assert_eq!(moved.assigned_node, "node-c");
        assert_eq!(moved.created_at, 9);
        assert_eq!(moved.image, rec.image);
    }
}
