use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("no subscribers listening")]
    NoSubscribers,
}

/// Trait implemented by payload types that can be carried on the bus.
pub trait Event: Clone + Send + Sync + std::fmt::Debug + 'static {}

impl<T> Event for T where T: Clone + Send + Sync + std::fmt::Debug + 'static {}

#[async_trait]
pub trait EventBus<E>: Send + Sync
where
    E: Event,
{
    async fn publish(&self, event: E) -> Result<(), BusError>;
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-memory broadcast bus. Publishing with nobody listening is reported, not fatal.
pub struct InMemoryBus<E>
where
    E: Event,
{
    sender: broadcast::Sender<E>,
}

impl<E> InMemoryBus<E>
where
    E: Event,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl<E> EventBus<E> for InMemoryBus<E>
where
    E: Event,
{
    async fn publish(&self, event: E) -> Result<(), BusError> {
        trace!(target: "event-bus", ?event, "publish");
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|_| BusError::NoSubscribers)
    }

    fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_reports_error() {
        let bus = InMemoryBus::<u32>::new(4);
        assert_eq!(bus.publish(1).await, Err(BusError::NoSubscribers));
    }

    #[tokio::test]
    async fn every_subscriber_sees_published_events() {
        let bus = InMemoryBus::<String>::new(4);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        bus.publish("stopped".to_string()).await.unwrap();
        assert_eq!(first.recv().await.unwrap(), "stopped");
        assert_eq!(second.recv().await.unwrap(), "stopped");
    }
}
