//! Inventory core.
//!
//! Products, their available stock, and the two request types that change
//! it: production (adds stock) and reservation (takes stock). Every change is
//! keyed by a caller-supplied request id so retries never apply twice.
//!
//! This crate has no IO of its own. Storage and notification transport are
//! behind [`InventoryRepository`] and [`InventoryPublisher`]; adapters live in
//! `stockflow-infra`.

pub mod error;
pub mod model;
pub mod publisher;
pub mod repository;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Committed, InventoryError, Operation, Stage};
pub use model::{
    Product, ProductInventory, ProductionEvent, ProductionRequest, Reservation,
    ReservationRequest, ReserveState, ValidReservation,
};
pub use publisher::{
    INVENTORY_TOPIC, InventoryChanged, InventoryPublisher, PublishError, RESERVATION_TOPIC,
    ReservationChanged,
};
pub use repository::{InventoryRepository, Pagination, RepositoryError, Transaction};
pub use service::{InventoryService, ServiceConfig};
