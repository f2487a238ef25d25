//! Scheduling policy seam: who runs a new task, and where orphaned work
//! lands after a node failure.
//!
//! The engine and failure detector only see the trait, so resource-aware
//! placement can slot in later. The reference policy assigns everything to
//! the local node, which is exactly what the periodic self-proposal demo
//! needs.

use std::fmt::Debug;

pub trait SchedulingPolicy: Debug + Send + Sync {
    /// Node that should run a newly submitted task.
    fn assign(&self, task_id: &str) -> String;

    /// New owner for a task orphaned by `failed`. `candidates` holds the
    /// labels currently considered live (the local node included), sorted.
    /// `None` leaves the task where it is.
    fn reassign(&self, task_id: &str, failed: &str, candidates: &[String]) -> Option<String>;
}

/// Reference policy: all work lands on the local node.
#[derive(Debug, Clone)]
pub struct AssignToSelf {
    node_id: String,
}

impl AssignToSelf {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

impl SchedulingPolicy for AssignToSelf {
    fn assign(&self, _task_id: &str) -> String {
        self.node_id.clone()
    }

    fn reassign(&self, _task_id: &str, failed: &str, _candidates: &[String]) -> Option<String> {
        if failed == self.node_id {
            return None;
        }
        Some(self.node_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_to_self() {
        let policy = AssignToSelf::new("node-a");
        assert_eq!(policy.assign("t1"), "node-a");
        assert_eq!(
            policy.reassign("t1", "node-b", &["node-a".into()]),
            Some("node-a".into())
        );
    }

    #[test]
    fn test_never_reassign_to_the_failed_node() {
        let policy = AssignToSelf::new("node-a");
        assert_eq!(policy.reassign("t1", "node-a", &[]), None);
    }
}
