//! Infrastructure layer: repositories, notification transports, config and
//! service wiring.

pub mod config;
pub mod publisher;
pub mod repository;
pub mod wiring;


pub use config::{ConfigError, InfraConfig, PostgresConfig};
pub use publisher::{BusPublisher, Topics};
#[cfg(feature = "redis")]
pub use publisher::RedisPublisher;
pub use repository::{InMemoryInventoryRepository, PostgresInventoryRepository};
pub use wiring::{InventoryServices, WiringError, build_in_memory_services, build_services};
