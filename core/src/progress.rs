//! Per-task progress topics: one writer (the worker), many readers.
//!
//! Each topic is a small broadcast ring plus a retained latest snapshot.
//! Late subscribers get the snapshot immediately; slow subscribers that lag
//! past the ring are resynchronized from the snapshot. A terminal event
//! drops the topic, which closes every subscriber's stream.

use crate::types::ProgressEvent;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Buffered events per topic; beyond this the oldest are dropped and lagging
/// subscribers coalesce to the snapshot.
const TOPIC_CAPACITY: usize = 64;

struct Topic {
    tx: broadcast::Sender<ProgressEvent>,
    latest: RwLock<ProgressEvent>,
}

/// A live subscription: the snapshot at subscribe time plus the change feed.
pub struct ProgressSubscription {
    pub snapshot: ProgressEvent,
    pub receiver: broadcast::Receiver<ProgressEvent>,
}

#[derive(Default)]
pub struct ProgressBus {
    topics: DashMap<Uuid, Arc<Topic>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a task's new snapshot. Terminal events close the topic.
    pub fn publish(&self, event: ProgressEvent) {
        let terminal = event.is_terminal();
        let topic = self
            .topics
            .entry(event.task_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(TOPIC_CAPACITY);
                Arc::new(Topic {
                    tx,
                    latest: RwLock::new(event.clone()),
                })
            })
            .clone();

        *topic.latest.write() = event.clone();
        // No receivers is fine; the snapshot still serves pollers.
        let _ = topic.tx.send(event.clone());

        if terminal {
            debug!(task_id = %event.task_id, state = event.state.as_str(), "Progress topic closed");
            self.topics.remove(&event.task_id);
        }
    }

    /// Subscribe to a task's progress. `None` when the topic is gone (task
    /// already terminal or never published); callers fall back to the store.
    pub fn subscribe(&self, task_id: Uuid) -> Option<ProgressSubscription> {
        let topic = self.topics.get(&task_id)?.clone();
        let snapshot = topic.latest.read().clone();
        Some(ProgressSubscription {
            snapshot,
            receiver: topic.tx.subscribe(),
        })
    }

    /// Latest retained snapshot, for polling and lag resync.
    pub fn latest(&self, task_id: Uuid) -> Option<ProgressEvent> {
        self.topics.get(&task_id).map(|t| t.latest.read().clone())
    }

    pub fn active_topics(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskState;
    use chrono::Utc;

    fn event(task_id: Uuid, state: TaskState, percent: u8) -> ProgressEvent {
        ProgressEvent {
            task_id,
            state,
            progress_percent: percent,
            message: format!("{} {}", state.as_str(), percent),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_gets_snapshot_then_changes() {
        let bus = ProgressBus::new();
        let task_id = Uuid::new_v4();
        bus.publish(event(task_id, TaskState::Downloading, 10));

        let mut sub = bus.subscribe(task_id).unwrap();
        assert_eq!(sub.snapshot.progress_percent, 10);

        bus.publish(event(task_id, TaskState::Extracting, 45));
        let received = sub.receiver.recv().await.unwrap();
        assert_eq!(received.progress_percent, 45);
    }

    #[tokio::test]
    async fn test_terminal_event_closes_topic() {
        let bus = ProgressBus::new();
        let task_id = Uuid::new_v4();
        bus.publish(event(task_id, TaskState::Analyzing, 80));
        let mut sub = bus.subscribe(task_id).unwrap();

        bus.publish(event(task_id, TaskState::Done, 100));
        assert!(bus.subscribe(task_id).is_none());
        assert_eq!(bus.active_topics(), 0);

        // The final event is still delivered, then the stream ends.
        let last = sub.receiver.recv().await.unwrap();
        assert_eq!(last.state, TaskState::Done);
        assert!(matches!(
            sub.receiver.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_lagged_subscriber_can_resync_from_latest() {
        let bus = ProgressBus::new();
        let task_id = Uuid::new_v4();
        bus.publish(event(task_id, TaskState::Queued, 0));
        let mut sub = bus.subscribe(task_id).unwrap();

        // Overflow the ring.
        for i in 0..(TOPIC_CAPACITY + 10) {
            bus.publish(event(task_id, TaskState::Analyzing, (50 + i % 40) as u8));
        }
        match sub.receiver.recv().await {
            Err(broadcast::error::RecvError::Lagged(_)) => {
                let snapshot = bus.latest(task_id).unwrap();
                assert_eq!(snapshot.state, TaskState::Analyzing);
            }
            other => panic!("expected lag, got {:?}", other.map(|e| e.progress_percent)),
        }
    }

    #[test]
    fn test_latest_for_pollers() {
        let bus = ProgressBus::new();
        let task_id = Uuid::new_v4();
        assert!(bus.latest(task_id).is_none());
        bus.publish(event(task_id, TaskState::Decrypting, 30));
        assert_eq!(bus.latest(task_id).unwrap().progress_percent, 30);
    }
}
