use crate::bus::{Bus, BusMessage, BusSubscription};
use crate::error::{Result, RosterError};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const MEMORY_BUS_CAPACITY: usize = 1024;

/// In-process bus; clones share subscribers.
#[derive(Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<BusMessage>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(MEMORY_BUS_CAPACITY);
        Self { sender }
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No subscribers is not an error, same as PUBLISH returning 0.
        let _ = self.sender.send(BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<BusSubscription> {
        if channels.is_empty() {
            return Err(RosterError::Bus(
                "subscribe requires at least one channel".to_string(),
            ));
        }

        let mut receiver = self.sender.subscribe();
        let channels = channels.to_vec();
        let (sender, subscription) = BusSubscription::channel();

        tokio::spawn(async move {
            loop {
                let message = match receiver.recv().await {
                    Ok(message) => message,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Memory bus subscriber lagged, skipped {}", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                if !channels.contains(&message.channel) {
                    continue;
                }

                if sender.send(message).await.is_err() {
                    break;
                }
            }
        });

        Ok(subscription)
    }
}
