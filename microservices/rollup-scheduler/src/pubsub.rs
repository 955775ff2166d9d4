//! Publish fan-out for freshly computed rollups

use async_trait::async_trait;
use dashmap::DashMap;
use sensorhub_core::Record;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &Record) -> Result<(), PublishError>;
}

/// In-process topic hub. Each topic is a broadcast channel created on first
/// subscription; publishing to a topic nobody listens on is a no-op.
pub struct BroadcastHub {
    topics: DashMap<String, broadcast::Sender<Arc<Record>>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Arc<Record>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Publisher for BroadcastHub {
    async fn publish(&self, topic: &str, payload: &Record) -> Result<(), PublishError> {
        let Some(sender) = self.topics.get(topic) else {
            trace!(topic, "No subscribers for topic");
            return Ok(());
        };

        match sender.send(Arc::new(payload.clone())) {
            Ok(receivers) => trace!(topic, receivers, "Published"),
            Err(_) => trace!(topic, "All subscribers for topic have gone"),
        }
        Ok(())
    }
}
