use chrono::{DateTime, Utc};

/// A message announcing a committed state change.
///
/// Notifications are:
/// - **facts**: they describe state that is already durable
/// - **versioned** (schema evolution)
/// - delivered **at least once**: consumers must tolerate duplicates and gaps
pub trait Notification: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable topic identifier (e.g. "inventory.product_inventory").
    fn topic(&self) -> &'static str;

    /// Schema version for this notification type.
    fn version(&self) -> u32 {
        1
    }

    /// When the underlying change was observed.
    fn occurred_at(&self) -> DateTime<Utc>;
}
