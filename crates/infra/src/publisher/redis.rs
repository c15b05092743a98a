//! Redis pub/sub publisher (feature `redis`).
//!
//! Redis pub/sub is not durable: subscribers that are offline miss messages.
//! That matches the best-effort contract of notifications; the repository
//! stays the source of truth.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use stockflow_events::NotificationEnvelope;
use stockflow_inventory::{
    InventoryChanged, InventoryPublisher, ProductInventory, PublishError, Reservation,
    ReservationChanged,
};

use super::Topics;

/// Publishes JSON notification envelopes on Redis channels.
///
/// Holds one multiplexed connection; clones share it.
#[derive(Clone)]
pub struct RedisPublisher {
    connection: MultiplexedConnection,
    topics: Topics,
}

impl core::fmt::Debug for RedisPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisPublisher")
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

impl RedisPublisher {
    pub async fn connect(redis_url: &str, topics: Topics) -> Result<Self, PublishError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| PublishError::Transport(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        Ok(Self { connection, topics })
    }

    async fn send(&self, envelope: NotificationEnvelope) -> Result<(), PublishError> {
        let payload =
            serde_json::to_string(&envelope).map_err(|e| PublishError::Encode(e.to_string()))?;

        let mut connection = self.connection.clone();
        let receivers: i64 = connection
            .publish(envelope.topic(), payload)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        debug!(
            channel = envelope.topic(),
            notification_id = %envelope.notification_id(),
            receivers,
            "notification published to redis"
        );
        Ok(())
    }
}

#[async_trait]
impl InventoryPublisher for RedisPublisher {
    async fn publish_inventory(&self, inventory: &ProductInventory) -> Result<(), PublishError> {
        let envelope = NotificationEnvelope::from_typed_on(
            &self.topics.inventory,
            &InventoryChanged::now(inventory),
        )
        .map_err(|e| PublishError::Encode(e.to_string()))?;
        self.send(envelope).await
    }

    async fn publish_reservation(&self, reservation: &Reservation) -> Result<(), PublishError> {
        let envelope = NotificationEnvelope::from_typed_on(
            &self.topics.reservation,
            &ReservationChanged::now(reservation),
        )
        .map_err(|e| PublishError::Encode(e.to_string()))?;
        self.send(envelope).await
    }
}
