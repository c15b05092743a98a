//! Publisher on top of an [`EventBus`].

use async_trait::async_trait;
use tracing::trace;

use stockflow_events::{EventBus, NotificationEnvelope};
use stockflow_inventory::{
    InventoryChanged, InventoryPublisher, ProductInventory, PublishError, Reservation,
    ReservationChanged,
};

use super::Topics;

/// Publishes notification envelopes on an [`EventBus`].
///
/// With an `InMemoryEventBus` this is the publisher used in tests and local
/// runs; subscribers see every envelope published after they subscribed.
#[derive(Debug, Clone)]
pub struct BusPublisher<B> {
    bus: B,
    topics: Topics,
}

impl<B> BusPublisher<B> {
    pub fn new(bus: B) -> Self {
        Self::with_topics(bus, Topics::default())
    }

    pub fn with_topics(bus: B, topics: Topics) -> Self {
        Self { bus, topics }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }
}

impl<B> BusPublisher<B>
where
    B: EventBus<NotificationEnvelope>,
{
    fn send(&self, envelope: NotificationEnvelope) -> Result<(), PublishError> {
        let topic = envelope.topic().to_string();
        let notification_id = envelope.notification_id();
        self.bus
            .publish(envelope)
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        trace!(%topic, %notification_id, "notification published");
        Ok(())
    }
}

#[async_trait]
impl<B> InventoryPublisher for BusPublisher<B>
where
    B: EventBus<NotificationEnvelope>,
{
    async fn publish_inventory(&self, inventory: &ProductInventory) -> Result<(), PublishError> {
        let envelope = NotificationEnvelope::from_typed_on(
            &self.topics.inventory,
            &InventoryChanged::now(inventory),
        )
        .map_err(|e| PublishError::Encode(e.to_string()))?;
        self.send(envelope)
    }

    async fn publish_reservation(&self, reservation: &Reservation) -> Result<(), PublishError> {
        let envelope = NotificationEnvelope::from_typed_on(
            &self.topics.reservation,
            &ReservationChanged::now(reservation),
        )
        .map_err(|e| PublishError::Encode(e.to_string()))?;
        self.send(envelope)
    }
}
