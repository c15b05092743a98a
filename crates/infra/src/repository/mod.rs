//! Inventory repository adapters.

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryInventoryRepository, InMemoryTransaction};
pub use postgres::{PgTransaction, PostgresInventoryRepository};
