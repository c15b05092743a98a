//! Recording test doubles for the repository and publisher boundaries.
//!
//! `RecordingRepository` keeps committed state in memory, stages writes per
//! transaction and counts every call. Failures can be injected per call kind,
//! either on every call or on the n-th one. Reads never see staged writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use stockflow_core::{Entity, RequestId, Sku};

use crate::model::{Product, ProductInventory, ProductionEvent, Reservation};
use crate::publisher::{InventoryPublisher, PublishError};
use crate::repository::{InventoryRepository, Pagination, RepositoryError, Transaction};

/// Repository (and transaction) call kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    BeginTransaction,
    GetProduct,
    SaveProduct,
    GetProductInventory,
    SaveProductInventory,
    GetAllProductInventory,
    GetProductionEventByRequestId,
    SaveProductionEvent,
    GetReservationByRequestId,
    SaveReservation,
    Commit,
    Rollback,
}

#[derive(Debug, Clone)]
enum Failure {
    Always(RepositoryError),
    /// Fail only the n-th call (1-based).
    Nth(usize, RepositoryError),
}

#[derive(Debug, Clone)]
enum Write {
    Product(Product),
    Inventory(ProductInventory),
    ProductionEvent(ProductionEvent),
    Reservation(Reservation),
}

#[derive(Debug, Default)]
struct Recorder {
    products: BTreeMap<Sku, Product>,
    inventory: BTreeMap<Sku, ProductInventory>,
    production_events: HashMap<RequestId, ProductionEvent>,
    reservations: HashMap<RequestId, Reservation>,
    calls: HashMap<Call, usize>,
    failures: HashMap<Call, Failure>,
}

impl Recorder {
    /// Count the call and return the injected failure for it, if any.
    fn record(&mut self, call: Call) -> Result<(), RepositoryError> {
        let count = self.calls.entry(call).or_default();
        *count += 1;
        let count = *count;

        match self.failures.get(&call) {
            Some(Failure::Always(err)) => Err(err.clone()),
            Some(Failure::Nth(n, err)) if *n == count => Err(err.clone()),
            _ => Ok(()),
        }
    }

    fn apply(&mut self, write: Write) {
        match write {
            Write::Product(p) => {
                self.products.insert(p.id().clone(), p);
            }
            Write::Inventory(i) => {
                self.inventory.insert(i.product.sku.clone(), i);
            }
            Write::ProductionEvent(e) => {
                self.production_events.insert(e.id().clone(), e);
            }
            Write::Reservation(r) => {
                self.reservations.insert(r.id().clone(), r);
            }
        }
    }
}

fn lock(recorder: &Mutex<Recorder>) -> MutexGuard<'_, Recorder> {
    recorder.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
pub struct RecordingRepository {
    inner: Arc<Mutex<Recorder>>,
}

impl RecordingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(self, product: Product) -> Self {
        lock(&self.inner).apply(Write::Product(product));
        self
    }

    pub fn with_inventory(self, inventory: ProductInventory) -> Self {
        lock(&self.inner).apply(Write::Inventory(inventory));
        self
    }

    pub fn with_production_event(self, event: ProductionEvent) -> Self {
        lock(&self.inner).apply(Write::ProductionEvent(event));
        self
    }

    pub fn with_reservation(self, reservation: Reservation) -> Self {
        lock(&self.inner).apply(Write::Reservation(reservation));
        self
    }

    /// Make every call of this kind fail with `err`.
    pub fn fail(&self, call: Call, err: RepositoryError) {
        lock(&self.inner).failures.insert(call, Failure::Always(err));
    }

    /// Make only the `nth` (1-based) call of this kind fail with `err`.
    pub fn fail_nth(&self, call: Call, nth: usize, err: RepositoryError) {
        lock(&self.inner).failures.insert(call, Failure::Nth(nth, err));
    }

    pub fn calls(&self, call: Call) -> usize {
        lock(&self.inner).calls.get(&call).copied().unwrap_or(0)
    }

    /// Total number of successful and failed writes of any kind.
    pub fn saves(&self) -> usize {
        [
            Call::SaveProduct,
            Call::SaveProductInventory,
            Call::SaveProductionEvent,
            Call::SaveReservation,
        ]
        .into_iter()
        .map(|call| self.calls(call))
        .sum()
    }

    pub fn product(&self, sku: &str) -> Option<Product> {
        lock(&self.inner).products.get(sku).cloned()
    }

    pub fn inventory(&self, sku: &str) -> Option<ProductInventory> {
        lock(&self.inner).inventory.get(sku).cloned()
    }

    pub fn production_events(&self) -> Vec<ProductionEvent> {
        lock(&self.inner).production_events.values().cloned().collect()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        lock(&self.inner).reservations.values().cloned().collect()
    }
}

/// Transaction of a [`RecordingRepository`].
#[derive(Debug)]
pub struct RecordingTransaction {
    recorder: Arc<Mutex<Recorder>>,
    staged: Vec<Write>,
}

impl RecordingTransaction {
    fn stage(&mut self, write: Write) {
        self.staged.push(write);
    }
}

#[async_trait]
impl Transaction for RecordingTransaction {
    async fn commit(&mut self) -> Result<(), RepositoryError> {
        let mut recorder = lock(&self.recorder);
        recorder.record(Call::Commit)?;
        for write in self.staged.drain(..) {
            recorder.apply(write);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), RepositoryError> {
        let mut recorder = lock(&self.recorder);
        recorder.record(Call::Rollback)?;
        self.staged.clear();
        Ok(())
    }
}

#[async_trait]
impl InventoryRepository for RecordingRepository {
    type Tx = RecordingTransaction;

    async fn begin_transaction(&self) -> Result<Self::Tx, RepositoryError> {
        lock(&self.inner).record(Call::BeginTransaction)?;
        Ok(RecordingTransaction {
            recorder: Arc::clone(&self.inner),
            staged: Vec::new(),
        })
    }

    async fn get_product(
        &self,
        sku: &Sku,
        _tx: Option<&mut Self::Tx>,
    ) -> Result<Product, RepositoryError> {
        let mut recorder = lock(&self.inner);
        recorder.record(Call::GetProduct)?;
        recorder.products.get(sku).cloned().ok_or(RepositoryError::NotFound)
    }

    async fn save_product(
        &self,
        tx: &mut Self::Tx,
        product: &Product,
    ) -> Result<(), RepositoryError> {
        {
            let mut recorder = lock(&self.inner);
            recorder.record(Call::SaveProduct)?;
            if recorder.products.contains_key(&product.sku) {
                return Err(RepositoryError::conflict(format!(
                    "product {} already exists",
                    product.sku
                )));
            }
        }
        tx.stage(Write::Product(product.clone()));
        Ok(())
    }

    async fn get_product_inventory(
        &self,
        sku: &Sku,
        _tx: Option<&mut Self::Tx>,
    ) -> Result<ProductInventory, RepositoryError> {
        let mut recorder = lock(&self.inner);
        recorder.record(Call::GetProductInventory)?;
        recorder.inventory.get(sku).cloned().ok_or(RepositoryError::NotFound)
    }

    async fn save_product_inventory(
        &self,
        tx: &mut Self::Tx,
        inventory: &ProductInventory,
    ) -> Result<(), RepositoryError> {
        lock(&self.inner).record(Call::SaveProductInventory)?;
        tx.stage(Write::Inventory(inventory.clone()));
        Ok(())
    }

    async fn get_all_product_inventory(
        &self,
        page: Pagination,
    ) -> Result<Vec<ProductInventory>, RepositoryError> {
        let mut recorder = lock(&self.inner);
        recorder.record(Call::GetAllProductInventory)?;
        Ok(recorder
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
        _tx: Option<&mut Self::Tx>,
    ) -> Result<ProductionEvent, RepositoryError> {
        let mut recorder = lock(&self.inner);
        recorder.record(Call::GetProductionEventByRequestId)?;
        recorder
            .production_events
            .get(request_id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn save_production_event(
        &self,
        tx: &mut Self::Tx,
        event: &ProductionEvent,
    ) -> Result<(), RepositoryError> {
        {
            let mut recorder = lock(&self.inner);
            recorder.record(Call::SaveProductionEvent)?;
            if recorder.production_events.contains_key(&event.request_id) {
                return Err(RepositoryError::conflict(format!(
                    "production event {} already exists",
                    event.request_id
                )));
            }
        }
        tx.stage(Write::ProductionEvent(event.clone()));
        Ok(())
    }

    async fn get_reservation_by_request_id(
        &self,
        request_id: &RequestId,
        _tx: Option<&mut Self::Tx>,
    ) -> Result<Reservation, RepositoryError> {
        let mut recorder = lock(&self.inner);
        recorder.record(Call::GetReservationByRequestId)?;
        recorder
            .reservations
            .get(request_id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn save_reservation(
        &self,
        tx: &mut Self::Tx,
        reservation: &Reservation,
    ) -> Result<(), RepositoryError> {
        {
            let mut recorder = lock(&self.inner);
            recorder.record(Call::SaveReservation)?;
            if recorder.reservations.contains_key(&reservation.request_id) {
                return Err(RepositoryError::conflict(format!(
                    "reservation {} already exists",
                    reservation.request_id
                )));
            }
        }
        tx.stage(Write::Reservation(reservation.clone()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Published {
    inventory: Vec<ProductInventory>,
    reservations: Vec<Reservation>,
    inventory_failure: Option<PublishError>,
    reservation_failure: Option<PublishError>,
    delay: Option<Duration>,
}

/// Publisher that keeps everything it is asked to publish.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    inner: Arc<Mutex<Published>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_inventory(&self, err: PublishError) {
        self.lock().inventory_failure = Some(err);
    }

    pub fn fail_reservations(&self, err: PublishError) {
        self.lock().reservation_failure = Some(err);
    }

    /// Sleep this long before every publish.
    pub fn delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    /// Inventory notifications attempted, including failed ones.
    pub fn inventory(&self) -> Vec<ProductInventory> {
        self.lock().inventory.clone()
    }

    /// Reservation notifications attempted, including failed ones.
    pub fn reservations(&self) -> Vec<Reservation> {
        self.lock().reservations.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Published> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self) {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl InventoryPublisher for RecordingPublisher {
    async fn publish_inventory(&self, inventory: &ProductInventory) -> Result<(), PublishError> {
        self.pause().await;
        let mut published = self.lock();
        published.inventory.push(inventory.clone());
        published.inventory_failure.clone().map_or(Ok(()), Err)
    }

    async fn publish_reservation(&self, reservation: &Reservation) -> Result<(), PublishError> {
        self.pause().await;
        let mut published = self.lock();
        published.reservations.push(reservation.clone());
        published.reservation_failure.clone().map_or(Ok(()), Err)
    }
}
