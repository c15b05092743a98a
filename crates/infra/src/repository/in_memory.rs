//! In-memory inventory repository.
//!
//! Transactions are serialised: `begin_transaction` takes an owned lock on
//! the whole state and works on a copy of it. Commit swaps the copy in;
//! rollback or drop throws it away. Reads outside a transaction wait for any
//! open transaction to finish, so a task must not read without its own
//! transaction while it holds one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use stockflow_core::{Entity, RequestId, Sku};
use stockflow_inventory::{
    InventoryRepository, Pagination, Product, ProductInventory, ProductionEvent, RepositoryError,
    Reservation, Transaction,
};

#[derive(Debug, Clone, Default)]
struct InventoryState {
    products: BTreeMap<Sku, Product>,
    inventory: BTreeMap<Sku, ProductInventory>,
    production_events: HashMap<RequestId, ProductionEvent>,
    reservations: HashMap<RequestId, Reservation>,
}

impl InventoryState {
    fn require_product(&self, sku: &Sku) -> Result<(), RepositoryError> {
        if !self.products.contains_key(sku) {
            return Err(RepositoryError::storage(format!("product {sku} does not exist")));
        }
        Ok(())
    }

    fn insert_product(&mut self, product: &Product) -> Result<(), RepositoryError> {
        if self.products.contains_key(product.id()) {
            return Err(RepositoryError::conflict(format!(
                "product {} already exists",
                product.sku
            )));
        }
        self.products.insert(product.id().clone(), product.clone());
        Ok(())
    }

    fn upsert_inventory(&mut self, inventory: &ProductInventory) -> Result<(), RepositoryError> {
        self.require_product(inventory.sku())?;
        if inventory.available < 0 {
            return Err(RepositoryError::storage(format!(
                "available stock of {} cannot be negative",
                inventory.sku()
            )));
        }
        self.inventory
            .insert(inventory.sku().clone(), inventory.clone());
        Ok(())
    }

    fn insert_production_event(&mut self, event: &ProductionEvent) -> Result<(), RepositoryError> {
        self.require_product(&event.sku)?;
        if self.production_events.contains_key(event.id()) {
            return Err(RepositoryError::conflict(format!(
                "production request {} already recorded",
                event.request_id
            )));
        }
        self.production_events
            .insert(event.id().clone(), event.clone());
        Ok(())
    }

    fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), RepositoryError> {
        self.require_product(&reservation.sku)?;
        if self.reservations.contains_key(reservation.id()) {
            return Err(RepositoryError::conflict(format!(
                "reservation request {} already recorded",
                reservation.request_id
            )));
        }
        self.reservations
            .insert(reservation.id().clone(), reservation.clone());
        Ok(())
    }
}

/// Transaction over an [`InMemoryInventoryRepository`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    guard: Option<OwnedMutexGuard<InventoryState>>,
    working: InventoryState,
}

impl InMemoryTransaction {
    fn working(&mut self) -> Result<&mut InventoryState, RepositoryError> {
        if self.guard.is_none() {
            return Err(RepositoryError::transaction("transaction already finished"));
        }
        Ok(&mut self.working)
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn commit(&mut self) -> Result<(), RepositoryError> {
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| RepositoryError::transaction("transaction already finished"))?;
        *guard = std::mem::take(&mut self.working);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), RepositoryError> {
        self.guard = None;
        self.working = InventoryState::default();
        Ok(())
    }
}

/// In-memory [`InventoryRepository`] for tests and local runs.
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryRepository {
    state: Arc<Mutex<InventoryState>>,
}

impl InMemoryInventoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn product(&self, sku: &str) -> Option<Product> {
        self.state.lock().await.products.get(sku).cloned()
    }

    pub async fn inventory(&self, sku: &str) -> Option<ProductInventory> {
        self.state.lock().await.inventory.get(sku).cloned()
    }

    pub async fn production_events(&self) -> Vec<ProductionEvent> {
        self.state
            .lock()
            .await
            .production_events
            .values()
            .cloned()
            .collect()
    }

    pub async fn reservations(&self) -> Vec<Reservation> {
        self.state
            .lock()
            .await
            .reservations
            .values()
            .cloned()
            .collect()
    }

    async fn read<T>(
        &self,
        tx: Option<&mut InMemoryTransaction>,
        find: impl FnOnce(&InventoryState) -> Option<T> + Send,
    ) -> Result<T, RepositoryError> {
        let found = match tx {
            Some(tx) => find(tx.working()?),
            None => find(&*self.state.lock().await),
        };
        found.ok_or(RepositoryError::NotFound)
    }
}

#[async_trait]
impl InventoryRepository for InMemoryInventoryRepository {
    type Tx = InMemoryTransaction;

    async fn begin_transaction(&self) -> Result<Self::Tx, RepositoryError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        tracing::trace!("in-memory transaction started");
        Ok(InMemoryTransaction {
            guard: Some(guard),
            working,
        })
    }

    async fn get_product(
        &self,
        sku: &Sku,
        tx: Option<&mut Self::Tx>,
    ) -> Result<Product, RepositoryError> {
        self.read(tx, |state| state.products.get(sku).cloned()).await
    }

    async fn save_product(
        &self,
        tx: &mut Self::Tx,
        product: &Product,
    ) -> Result<(), RepositoryError> {
        tx.working()?.insert_product(product)
    }

    async fn get_product_inventory(
        &self,
        sku: &Sku,
        tx: Option<&mut Self::Tx>,
    ) -> Result<ProductInventory, RepositoryError> {
        self.read(tx, |state| state.inventory.get(sku).cloned()).await
    }

    async fn save_product_inventory(
        &self,
        tx: &mut Self::Tx,
        inventory: &ProductInventory,
    ) -> Result<(), RepositoryError> {
        tx.working()?.upsert_inventory(inventory)
    }

    async fn get_all_product_inventory(
        &self,
        page: Pagination,
    ) -> Result<Vec<ProductInventory>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .inventory
            .values()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn get_production_event_by_request_id(
        &self,
        request_id: &RequestId,
        tx: Option<&mut Self::Tx>,
    ) -> Result<ProductionEvent, RepositoryError> {
        self.read(tx, |state| state.production_events.get(request_id).cloned())
            .await
    }

    async fn save_production_event(
        &self,
        tx: &mut Self::Tx,
        event: &ProductionEvent,
    ) -> Result<(), RepositoryError> {
        tx.working()?.insert_production_event(event)
    }

    async fn get_reservation_by_request_id(
        &self,
        request_id: &RequestId,
        tx: Option<&mut Self::Tx>,
    ) -> Result<Reservation, RepositoryError> {
        self.read(tx, |state| state.reservations.get(request_id).cloned())
            .await
    }

    async fn save_reservation(
        &self,
        tx: &mut Self::Tx,
        reservation: &Reservation,
    ) -> Result<(), RepositoryError> {
        tx.working()?.insert_reservation(reservation)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;

    fn product(sku: &str) -> Product {
        Product::new(sku, "upc", "name").unwrap()
    }

    async fn with_products(skus: &[&str]) -> InMemoryInventoryRepository {
        let repo = InMemoryInventoryRepository::new();
        let mut tx = repo.begin_transaction().await.unwrap();
        for sku in skus {
            repo.save_product(&mut tx, &product(sku)).await.unwrap();
            repo.save_product_inventory(&mut tx, &ProductInventory::empty(product(sku)))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
        repo
    }

    fn event(request_id: &str, sku: &str) -> ProductionEvent {
        ProductionEvent::new(
            RequestId::new(request_id).unwrap(),
            Sku::new(sku).unwrap(),
            1,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn committed_writes_become_visible() {
        let repo = with_products(&["sku1"]).await;

        assert_eq!(repo.product("sku1").await, Some(product("sku1")));
        assert_eq!(repo.inventory("sku1").await.unwrap().available, 0);
    }

    #[tokio::test]
    async fn rolled_back_and_dropped_writes_are_discarded() {
        let repo = with_products(&["sku1"]).await;

        let mut tx = repo.begin_transaction().await.unwrap();
        repo.save_production_event(&mut tx, &event("r1", "sku1")).await.unwrap();
        tx.rollback().await.unwrap();

        {
            let mut tx = repo.begin_transaction().await.unwrap();
            repo.save_production_event(&mut tx, &event("r2", "sku1")).await.unwrap();
        }

        assert!(repo.production_events().await.is_empty());
    }

    #[tokio::test]
    async fn transactions_read_their_own_writes() {
        let repo = with_products(&["sku1"]).await;
        let mut tx = repo.begin_transaction().await.unwrap();

        let mut inventory = repo
            .get_product_inventory(&Sku::new("sku1").unwrap(), Some(&mut tx))
            .await
            .unwrap();
        inventory.available = 4;
        repo.save_product_inventory(&mut tx, &inventory).await.unwrap();

        let reread = repo
            .get_product_inventory(&Sku::new("sku1").unwrap(), Some(&mut tx))
            .await
            .unwrap();
        assert_eq!(reread.available, 4);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_keys_conflict() {
        let repo = with_products(&["sku1"]).await;

        let mut tx = repo.begin_transaction().await.unwrap();
        assert!(matches!(
            repo.save_product(&mut tx, &product("sku1")).await,
            Err(RepositoryError::Conflict(_))
        ));
        repo.save_production_event(&mut tx, &event("r1", "sku1")).await.unwrap();
        assert!(matches!(
            repo.save_production_event(&mut tx, &event("r1", "sku1")).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn rows_are_found_by_their_entity_id() {
        let repo = with_products(&["sku1"]).await;
        let reservation = Reservation::open(
            stockflow_inventory::ReservationRequest::new("r7", "sku1", "user1", 2)
                .validate()
                .unwrap(),
            Utc::now(),
        );

        let mut tx = repo.begin_transaction().await.unwrap();
        repo.save_production_event(&mut tx, &event("r7", "sku1")).await.unwrap();
        repo.save_reservation(&mut tx, &reservation).await.unwrap();
        tx.commit().await.unwrap();

        let product = repo.get_product(product("sku1").id(), None).await.unwrap();
        assert_eq!(product.id().as_str(), "sku1");
        let stored = repo
            .get_reservation_by_request_id(reservation.id(), None)
            .await
            .unwrap();
        assert_eq!(stored, reservation);
        let recorded = repo
            .get_production_event_by_request_id(reservation.id(), None)
            .await
            .unwrap();
        assert_eq!(recorded.id(), reservation.id());
    }

    #[tokio::test]
    async fn rows_must_reference_a_product() {
        let repo = InMemoryInventoryRepository::new();
        let mut tx = repo.begin_transaction().await.unwrap();

        assert!(matches!(
            repo.save_production_event(&mut tx, &event("r1", "ghost")).await,
            Err(RepositoryError::Storage(_))
        ));
        assert!(matches!(
            repo.save_product_inventory(&mut tx, &ProductInventory::empty(product("ghost")))
                .await,
            Err(RepositoryError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn finished_transactions_reject_writes() {
        let repo = with_products(&["sku1"]).await;
        let mut tx = repo.begin_transaction().await.unwrap();
        tx.commit().await.unwrap();

        assert!(matches!(
            repo.save_production_event(&mut tx, &event("r1", "sku1")).await,
            Err(RepositoryError::Transaction(_))
        ));
        assert!(tx.commit().await.is_err());
        assert!(tx.rollback().await.is_ok());
    }

    #[tokio::test]
    async fn listing_is_ordered_by_sku_and_paginated() {
        let repo = with_products(&["c", "a", "d", "b"]).await;

        let page = repo
            .get_all_product_inventory(Pagination { limit: 2, offset: 1 })
            .await
            .unwrap();
        let skus: Vec<_> = page.iter().map(|i| i.sku().to_string()).collect();

        assert_eq!(skus, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn transactions_are_serialised() {
        let repo = with_products(&["sku1"]).await;
        let mut first = repo.begin_transaction().await.unwrap();

        let other = repo.clone();
        let second = tokio::spawn(async move { other.begin_transaction().await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        first.rollback().await.unwrap();
        second.await.unwrap().unwrap();
    }
}
