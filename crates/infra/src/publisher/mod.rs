//! Notification publisher adapters.
//!
//! Both adapters wrap the committed row in a [`NotificationEnvelope`] and
//! send it on the configured topic; they differ only in transport.
//!
//! [`NotificationEnvelope`]: stockflow_events::NotificationEnvelope

pub mod bus;
#[cfg(feature = "redis")]
pub mod redis;

pub use bus::BusPublisher;
#[cfg(feature = "redis")]
pub use redis::RedisPublisher;

use stockflow_inventory::{INVENTORY_TOPIC, RESERVATION_TOPIC};

/// Topics (or channels) notifications are published on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub inventory: String,
    pub reservation: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            inventory: INVENTORY_TOPIC.to_string(),
            reservation: RESERVATION_TOPIC.to_string(),
        }
    }
}
