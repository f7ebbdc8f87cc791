//! Run progress fan-out over `tokio::sync::broadcast`.
//!
//! Publishing with no subscribers is a no-op. A subscriber that falls behind
//! loses the oldest events rather than stalling the scheduler.

use nodeflow_types::event::WorkflowEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

/// Multi-consumer event bus for run progress events.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every future event of every run.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Receive the future events of one run, ending after its `RunFinished`.
    pub fn subscribe_run(&self, run_id: Uuid) -> RunEvents {
        RunEvents {
            run_id,
            receiver: self.sender.subscribe(),
            finished: false,
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Events of a single run, in publish order.
pub struct RunEvents {
    run_id: Uuid,
    receiver: broadcast::Receiver<WorkflowEvent>,
    finished: bool,
}

impl RunEvents {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Next event of this run. `None` once the run finished or the bus closed.
    ///
    /// Lagged events are dropped with a debug log.
    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.run_id() == self.run_id => {
                    self.finished = matches!(event, WorkflowEvent::RunFinished { .. });
                    return Some(event);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(run_id = %self.run_id, skipped, "run events lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_types::run::RunStatus;

    fn sample_event() -> WorkflowEvent {
        started(Uuid::now_v7(), "fetch")
    }

    fn started(run_id: Uuid, node: &str) -> WorkflowEvent {
        WorkflowEvent::NodeStarted {
            run_id,
            node: node.to_string(),
            node_type: "http".to_string(),
            item_index: None,
        }
    }

    fn finished(run_id: Uuid) -> WorkflowEvent {
        WorkflowEvent::RunFinished {
            run_id,
            workflow_name: "wf".to_string(),
            status: RunStatus::Completed,
            duration_ms: 1,
            error: None,
        }
    }

    #[tokio::test]
    async fn run_subscription_filters_and_ends_on_finish() {
        let bus = EventBus::new(16);
        let mine = Uuid::now_v7();
        let other = Uuid::now_v7();
        let mut events = bus.subscribe_run(mine);

        bus.publish(started(other, "noise"));
        bus.publish(started(mine, "fetch"));
        bus.publish(finished(other));
        bus.publish(finished(mine));
        bus.publish(started(mine, "late"));

        assert!(matches!(events.next().await, Some(WorkflowEvent::NodeStarted { node, .. }) if node == "fetch"));
        assert!(matches!(events.next().await, Some(WorkflowEvent::RunFinished { run_id, .. }) if run_id == mine));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn run_subscription_ends_when_bus_dropped() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe_run(Uuid::now_v7());
        drop(bus);
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(sample_event());

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, WorkflowEvent::NodeStarted { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(sample_event());

        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[test]
    fn publish_with_no_subscribers_is_noop() {
        let bus = EventBus::new(16);
        bus.publish(sample_event());
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(sample_event());

        assert!(rx.try_recv().is_ok());
    }
}
