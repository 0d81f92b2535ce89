//! Broadcast Event Bus
//!
//! `EventBus` over a `tokio::sync::broadcast` channel. Publishing never blocks;
//! slow subscribers lose the oldest events.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ports::EventBus;

#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub topic: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Log every event until `cancel` fires
    pub fn spawn_logger(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => info!(topic = %event.topic, payload = %event.payload, "Event"),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Event logger lagged")
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, topic: &str, payload: serde_json::Value) {
        let event = EngineEvent {
            topic: topic.to_string(),
            payload,
        };
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            debug!(topic, "Event dropped: no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::topics;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = BroadcastEventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(topics::INSTANCE_STARTED, serde_json::json!({"instance_id": "a"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, topics::INSTANCE_STARTED);
        assert_eq!(event.payload["instance_id"], "a");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = BroadcastEventBus::default();
        bus.publish(topics::INSTANCE_TICK, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = BroadcastEventBus::new(2);
        let mut rx = bus.subscribe();
        for n in 0..5 {
            bus.publish("t", serde_json::json!({ "n": n }));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(rx.recv().await.unwrap().payload["n"], 3);
    }

    #[tokio::test]
    async fn test_logger_stops_on_cancel() {
        let bus = BroadcastEventBus::default();
        let cancel = CancellationToken::new();
        let handle = bus.spawn_logger(cancel.clone());
        bus.publish("t", serde_json::json!({}));
        cancel.cancel();
        handle.await.unwrap();
    }
}
