//! Run progress for external observers.
//!
//! The engine loop is the only writer; `snapshot` hands out clones so
//! readers never hold the lock across an await.

use std::sync::RwLock;

use chrono::Utc;
use nodeflow_types::run::{NodeSnapshot, NodeStatus, RunSnapshot, RunStatus};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug)]
pub struct RunTracker {
    state: RwLock<RunSnapshot>,
}

impl RunTracker {
    /// A pending run with every node pending.
    pub fn new<'a>(run_id: Uuid, workflow_name: &str, nodes: impl IntoIterator<Item = &'a str>) -> Self {
        let mut snapshot = RunSnapshot::new(run_id, workflow_name);
        for node in nodes {
            snapshot.nodes.insert(node.to_string(), NodeSnapshot::default());
        }
        Self {
            state: RwLock::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update(&self, f: impl FnOnce(&mut RunSnapshot)) {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    fn update_node(&self, node: &str, f: impl FnOnce(&mut NodeSnapshot)) {
        self.update(|s| {
            if let Some(n) = s.nodes.get_mut(node) {
                f(n);
            }
        });
    }

    pub fn start(&self) {
        self.update(|s| {
            s.status = RunStatus::Running;
            s.started_at = Some(Utc::now());
        });
    }

    pub fn set_status(&self, node: &str, status: NodeStatus) {
        self.update_node(node, |n| n.status = status);
    }

    pub fn node_started(&self, node: &str) {
        self.update_node(node, |n| {
            n.status = NodeStatus::Running;
            n.started_at = Some(Utc::now());
        });
    }

    pub fn set_attempts(&self, node: &str, attempts: u32) {
        self.update_node(node, |n| n.attempts = attempts);
    }

    pub fn node_completed(&self, node: &str, output: Value) {
        self.update_node(node, |n| {
            n.status = NodeStatus::Completed;
            n.output = Some(output);
            n.completed_at = Some(Utc::now());
        });
    }

    pub fn node_failed(&self, node: &str, error: &str) {
        self.update_node(node, |n| {
            n.status = NodeStatus::Failed;
            n.error = Some(error.to_string());
            n.completed_at = Some(Utc::now());
        });
    }

    pub fn node_skipped(&self, node: &str) {
        self.update_node(node, |n| {
            n.status = NodeStatus::Skipped;
            n.completed_at = Some(Utc::now());
        });
    }

    pub fn finish(&self, status: RunStatus, error: Option<String>) {
        self.update(|s| {
            s.status = status;
            s.error = error;
            s.completed_at = Some(Utc::now());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tracks_node_lifecycle() {
        let tracker = RunTracker::new(Uuid::now_v7(), "wf", ["a", "b"]);
        assert_eq!(tracker.snapshot().count(NodeStatus::Pending), 2);

        tracker.start();
        tracker.node_started("a");
        tracker.set_attempts("a", 2);
        tracker.node_completed("a", json!(42));
        tracker.node_skipped("b");

        let snap = tracker.snapshot();
        assert_eq!(snap.status, RunStatus::Running);
        assert_eq!(snap.nodes["a"].status, NodeStatus::Completed);
        assert_eq!(snap.nodes["a"].output, Some(json!(42)));
        assert_eq!(snap.nodes["a"].attempts, 2);
        assert!(snap.nodes["a"].started_at.is_some());
        assert_eq!(snap.nodes["b"].status, NodeStatus::Skipped);
    }

    #[test]
    fn finish_records_error() {
        let tracker = RunTracker::new(Uuid::now_v7(), "wf", ["a"]);
        tracker.start();
        tracker.node_failed("a", "boom");
        tracker.finish(RunStatus::Failed, Some("workflow timed out".into()));
        let snap = tracker.snapshot();
        assert_eq!(snap.status, RunStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("workflow timed out"));
        assert_eq!(snap.nodes["a"].error.as_deref(), Some("boom"));
        assert!(snap.completed_at.is_some());
    }

    #[test]
    fn unknown_node_updates_are_ignored() {
        let tracker = RunTracker::new(Uuid::now_v7(), "wf", ["a"]);
        tracker.node_started("ghost");
        assert!(!tracker.snapshot().nodes.contains_key("ghost"));
    }
}
