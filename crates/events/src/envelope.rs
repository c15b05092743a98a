use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Notification;

/// Envelope for a published notification.
///
/// This is the unit that goes over the bus.
///
/// Notes:
/// - `notification_id` is unique per publication attempt, so consumers can
///   recognise redeliveries of the same message.
/// - `topic` routes the message (inventory vs reservation changes).
/// - `payload` is the JSON encoding of the state that was committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    notification_id: Uuid,
    topic: String,
    version: u32,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl NotificationEnvelope {
    pub fn new(
        notification_id: Uuid,
        topic: impl Into<String>,
        version: u32,
        occurred_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            notification_id,
            topic: topic.into(),
            version,
            occurred_at,
            payload,
        }
    }

    /// Wrap a typed notification, encoding it as the JSON payload.
    pub fn from_typed<N>(notification: &N) -> Result<Self, serde_json::Error>
    where
        N: Notification + Serialize,
    {
        Ok(Self::new(
            Uuid::now_v7(),
            notification.topic(),
            notification.version(),
            notification.occurred_at(),
            serde_json::to_value(notification)?,
        ))
    }

    /// Same as [`from_typed`](Self::from_typed) but published under `topic`
    /// instead of the notification's default topic.
    pub fn from_typed_on<N>(topic: &str, notification: &N) -> Result<Self, serde_json::Error>
    where
        N: Notification + Serialize,
    {
        let mut envelope = Self::from_typed(notification)?;
        envelope.topic = topic.to_string();
        Ok(envelope)
    }

    pub fn notification_id(&self) -> Uuid {
        self.notification_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Decode the payload back into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
