//! Storage boundary.
//!
//! The repository is the system of record. Writes always go through a
//! [`Transaction`]; reads may run inside one (then inventory rows are read
//! for update) or directly against committed state.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use stockflow_core::{RequestId, Sku};

use crate::model::{Product, ProductInventory, ProductionEvent, Reservation};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("not found")]
    NotFound,

    /// A uniqueness constraint rejected the write (duplicate sku or request id).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Begin, commit or rollback failed.
    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// A unit of work against the repository.
///
/// Dropping a transaction that was neither committed nor rolled back must
/// discard its writes. Rolling back a finished transaction is a no-op.
#[async_trait]
pub trait Transaction: Send {
    async fn commit(&mut self) -> Result<(), RepositoryError>;

    async fn rollback(&mut self) -> Result<(), RepositoryError>;
}

/// Page of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Pagination {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 1000;

    /// Build a page from optional caller input, applying the default limit
    /// and capping it at [`MAX_LIMIT`](Self::MAX_LIMIT).
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(Self::DEFAULT_LIMIT).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Inventory storage.
///
/// Single-row lookups return [`RepositoryError::NotFound`] when the row is
/// absent. Inserts of rows keyed by sku or request id return
/// [`RepositoryError::Conflict`] when the key is already taken; this is what
/// makes concurrent duplicate requests safe.
#[async_trait]
pub trait InventoryRepository: Send + Sync {
    type Tx: Transaction;

    async fn begin_transaction(&self) -> Result<Self::Tx, RepositoryError>;

    async fn get_product(
        &self,
        sku: &Sku,
        tx: Option<&mut Self::Tx>,
    ) -> Result<Product, RepositoryError>;

    async fn save_product(&self, tx: &mut Self::Tx, product: &Product)
    -> Result<(), RepositoryError>;

    /// Inside a transaction the row is locked until the transaction ends.
    async fn get_product_inventory(
        &self,
        sku: &Sku,
        tx: Option<&mut Self::Tx>,
    ) -> Result<ProductInventory, RepositoryError>;

    /// Insert or replace the inventory row of `inventory.product.sku`.
    async fn save_product_inventory(
        &self,
        tx: &mut Self::Tx,
        inventory: &ProductInventory,
    ) -> Result<(), RepositoryError>;

    /// Inventory rows ordered by sku.
    async fn get_all_product_inventory(
        &self,
        page: Pagination,
    ) -> Result<Vec<ProductInventory>, RepositoryError>;

    async fn get_production_event_by_request_id(
        &self,
        request_id: &RequestId,
        tx: Option<&mut Self::Tx>,
    ) -> Result<ProductionEvent, RepositoryError>;

    async fn save_production_event(
        &self,
        tx: &mut Self::Tx,
        event: &ProductionEvent,
    ) -> Result<(), RepositoryError>;

    async fn get_reservation_by_request_id(
        &self,
        request_id: &RequestId,
        tx: Option<&mut Self::Tx>,
    ) -> Result<Reservation, RepositoryError>;

    async fn save_reservation(
        &self,
        tx: &mut Self::Tx,
        reservation: &Reservation,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
impl<R> InventoryRepository for Arc<R>
where
    R: InventoryRepository + ?Sized,
{
    type Tx = R::Tx;

    async fn begin_transaction(&self) -> Result<Self::Tx, RepositoryError> {
        (**self).begin_transaction().await
    }

    async fn get_product(
        &self,
        sku: &Sku,
        tx: Option<&mut Self::Tx>,
    ) -> Result<Product, RepositoryError> {
        (**self).get_product(sku, tx).await
    }

    async fn save_product(
        &self,
        tx: &mut Self::Tx,
        product: &Product,
    ) -> Result<(), RepositoryError> {
        (**self).save_product(tx, product).await
    }

    async fn get_product_inventory(
        &self,
        sku: &Sku,
        tx: Option<&mut Self::Tx>,
    ) -> Result<ProductInventory, RepositoryError> {
        (**self).get_product_inventory(sku, tx).await
    }

    async fn save_product_inventory(
        &self,
        tx: &mut Self::Tx,
        inventory: &ProductInventory,
    ) -> Result<(), RepositoryError> {
        (**self).save_product_inventory(tx, inventory).await
    }

    async fn get_all_product_inventory(
        &self,
        page: Pagination,
    ) -> Result<Vec<ProductInventory>, RepositoryError> {
        (**self).get_all_product_inventory(page).await
    }

    async fn get_production_event_by_request_id(
        &self,
        request_id: &RequestId,
        tx: Option<&mut Self::Tx>,
    ) -> Result<ProductionEvent, RepositoryError> {
        (**self).get_production_event_by_request_id(request_id, tx).await
    }

    async fn save_production_event(
        &self,
        tx: &mut Self::Tx,
        event: &ProductionEvent,
    ) -> Result<(), RepositoryError> {
        (**self).save_production_event(tx, event).await
    }

    async fn get_reservation_by_request_id(
        &self,
        request_id: &RequestId,
        tx: Option<&mut Self::Tx>,
    ) -> Result<Reservation, RepositoryError> {
        (**self).get_reservation_by_request_id(request_id, tx).await
    }

    async fn save_reservation(
        &self,
        tx: &mut Self::Tx,
        reservation: &Reservation,
    ) -> Result<(), RepositoryError> {
        (**self).save_reservation(tx, reservation).await
    }
}
