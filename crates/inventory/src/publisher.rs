//! Notification boundary.
//!
//! Publication happens after a change has committed and is not part of any
//! transaction: a failed publish never undoes the change it announces.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockflow_events::Notification;

use crate::model::{ProductInventory, Reservation};

/// Default topic for inventory level notifications.
pub const INVENTORY_TOPIC: &str = "inventory.product_inventory";
/// Default topic for reservation notifications.
pub const RESERVATION_TOPIC: &str = "inventory.reservation";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode notification: {0}")]
    Encode(String),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait InventoryPublisher: Send + Sync {
    async fn publish_inventory(&self, inventory: &ProductInventory) -> Result<(), PublishError>;

    async fn publish_reservation(&self, reservation: &Reservation) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> InventoryPublisher for Arc<P>
where
    P: InventoryPublisher + ?Sized,
{
    async fn publish_inventory(&self, inventory: &ProductInventory) -> Result<(), PublishError> {
        (**self).publish_inventory(inventory).await
    }

    async fn publish_reservation(&self, reservation: &Reservation) -> Result<(), PublishError> {
        (**self).publish_reservation(reservation).await
    }
}

/// The committed inventory level of a product.
///
/// Serialises as the inventory row plus `occurred_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryChanged {
    #[serde(flatten)]
    pub inventory: ProductInventory,
    pub occurred_at: DateTime<Utc>,
}

impl InventoryChanged {
    pub fn now(inventory: &ProductInventory) -> Self {
        Self {
            inventory: inventory.clone(),
            occurred_at: Utc::now(),
        }
    }
}

impl Notification for InventoryChanged {
    fn topic(&self) -> &'static str {
        INVENTORY_TOPIC
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// A committed reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationChanged {
    #[serde(flatten)]
    pub reservation: Reservation,
    pub occurred_at: DateTime<Utc>,
}

impl ReservationChanged {
    pub fn now(reservation: &Reservation) -> Self {
        Self {
            reservation: reservation.clone(),
            occurred_at: Utc::now(),
        }
    }
}

impl Notification for ReservationChanged {
    fn topic(&self) -> &'static str {
        RESERVATION_TOPIC
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
