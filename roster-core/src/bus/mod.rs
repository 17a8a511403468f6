//! Publish/subscribe bus between nodes.

pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::MemoryBus;
pub use redis::RedisBus;

const SUBSCRIPTION_BUFFER: usize = 256;

/// One message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Stream of messages for the channels a subscriber asked for.
///
/// Delivery is at-least-once with no ordering across channels.
pub struct BusSubscription {
    receiver: mpsc::Receiver<BusMessage>,
}

impl BusSubscription {
    pub(crate) fn channel() -> (mpsc::Sender<BusMessage>, Self) {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        (sender, Self { receiver })
    }

    /// Next message, or `None` once the underlying connection is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    async fn subscribe(&self, channels: &[String]) -> Result<BusSubscription>;
}
