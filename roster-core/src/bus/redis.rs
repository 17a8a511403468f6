use crate::bus::{Bus, BusMessage, BusSubscription};
use crate::error::{Result, RosterError};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};

/// Redis pub/sub bus.
///
/// Publishing goes through the shared multiplexed connection; every
/// subscription opens its own pub/sub connection.
pub struct RedisBus {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisBus {
    pub fn new(client: Client, conn: MultiplexedConnection) -> Self {
        Self { client, conn }
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload).await.map_err(|e| {
            RosterError::Bus(format!("Failed to publish to {}: {}", channel, e))
        })?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<BusSubscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| RosterError::Bus(format!("Failed to open pub/sub connection: {}", e)))?;

        for channel in channels {
            pubsub.subscribe(channel).await.map_err(|e| {
                RosterError::Bus(format!("Failed to subscribe to {}: {}", channel, e))
            })?;
        }

        let (sender, subscription) = BusSubscription::channel();
        let subscribed = channels.join(",");

        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(error) => {
                        tracing::debug!(
                            "Dropping undecodable message on {}: {}",
                            message.get_channel_name(),
                            error
                        );
                        continue;
                    }
                };

                let delivered = sender
                    .send(BusMessage {
                        channel: message.get_channel_name().to_string(),
                        payload,
                    })
                    .await;
                if delivered.is_err() {
                    break;
                }
            }
            tracing::info!("Pub/sub stream for {} closed", subscribed);
        });

        Ok(subscription)
    }
}
