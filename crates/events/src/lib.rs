//! Notification mechanics: what gets published after a state change commits,
//! and the transport-agnostic bus it is published on.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::NotificationEnvelope;
pub use event::Notification;
pub use in_memory_bus::{BusError, InMemoryEventBus};
