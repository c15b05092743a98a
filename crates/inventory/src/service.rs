//! Inventory request handling.
//!
//! ```text
//! validate → idempotency check → stage 1 (record) → stage 2 (apply) → publish
//! ```
//!
//! `Produce` and `Reserve` commit in two independent transactions: the first
//! records the request under its idempotency key, the second changes stock.
//! Once the first commits, a retry of the same request is a no-op, even if
//! the second failed. Notifications go out only after the second commit and
//! their failure never undoes anything.
//!
//! Duplicate detection relies on the repository rejecting a second insert of
//! the same key with [`RepositoryError::Conflict`]; the reads that precede
//! each insert only make the common replay cheap.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use stockflow_core::Sku;

use crate::error::{Committed, InventoryError, Operation, Stage};
use crate::model::{
    Product, ProductInventory, ProductionEvent, ProductionRequest, Reservation,
    ReservationRequest, ValidReservation,
};
use crate::publisher::{InventoryPublisher, PublishError};
use crate::repository::{InventoryRepository, Pagination, RepositoryError, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Upper bound on a single notification publish.
    pub publish_timeout: Duration,
}

impl ServiceConfig {
    pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Self::DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

/// What a stage body asks for once it is done.
enum StageOutcome<T> {
    Commit(T),
    /// Nothing to write after all (a replayed request): roll back.
    Discard(T),
}

enum Recorded {
    Created(Reservation),
    Existing(Reservation),
    /// Another request with the same key committed first.
    Raced,
}

/// Entry point for inventory requests.
///
/// Holds no state between calls; share it behind an `Arc` to serve
/// concurrent requests.
#[derive(Debug, Clone)]
pub struct InventoryService<R, P> {
    repository: R,
    publisher: P,
    config: ServiceConfig,
}

impl<R, P> InventoryService<R, P> {
    pub fn new(repository: R, publisher: P) -> Self {
        Self::with_config(repository, publisher, ServiceConfig::default())
    }

    pub fn with_config(repository: R, publisher: P, config: ServiceConfig) -> Self {
        Self {
            repository,
            publisher,
            config,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

impl<R, P> InventoryService<R, P>
where
    R: InventoryRepository,
    P: InventoryPublisher,
{
    /// Register a product with an empty inventory row.
    ///
    /// Creating an existing product succeeds without writing anything.
    #[instrument(name = "create_product", skip_all, fields(sku = %product.sku))]
    pub async fn create_product(&self, product: Product) -> Result<(), InventoryError> {
        const OP: Operation = Operation::CreateProduct;

        match self.repository.get_product(&product.sku, None).await {
            Ok(_) => {
                info!("product already exists");
                return Ok(());
            }
            Err(RepositoryError::NotFound) => {}
            Err(err) => return Err(InventoryError::storage(OP, Stage::IdempotencyCheck, err)),
        }

        let mut tx = self.begin(OP, Stage::Record).await?;
        let outcome = self.insert_product(&mut tx, &product).await;
        if self.finish(tx, OP, Stage::Record, outcome).await? {
            info!("product created");
        } else {
            info!("product created by a concurrent request");
        }
        Ok(())
    }

    /// Add `request.quantity` units to the product's available stock.
    #[instrument(
        name = "produce",
        skip_all,
        fields(sku = %product.sku, request_id = %request.request_id, quantity = request.quantity)
    )]
    pub async fn produce(
        &self,
        product: Product,
        request: ProductionRequest,
    ) -> Result<(), InventoryError> {
        const OP: Operation = Operation::Produce;

        let request_id = request.validate().inspect_err(|err| {
            debug!(error = %err, "production request rejected");
        })?;

        match self
            .repository
            .get_production_event_by_request_id(&request_id, None)
            .await
        {
            Ok(_) => {
                info!("production request already processed");
                return Ok(());
            }
            Err(RepositoryError::NotFound) => {}
            Err(err) => return Err(InventoryError::storage(OP, Stage::IdempotencyCheck, err)),
        }

        let event = ProductionEvent::new(
            request_id,
            product.sku.clone(),
            request.quantity,
            Utc::now(),
        );
        let mut tx = self.begin(OP, Stage::Record).await?;
        let outcome = match self.repository.save_production_event(&mut tx, &event).await {
            Ok(()) => Ok(StageOutcome::Commit(true)),
            Err(RepositoryError::Conflict(_)) => Ok(StageOutcome::Discard(false)),
            Err(err) => Err(InventoryError::storage(OP, Stage::Record, err)),
        };
        if !self.finish(tx, OP, Stage::Record, outcome).await? {
            info!("production request recorded by a concurrent request");
            return Ok(());
        }

        let mut tx = self.begin(OP, Stage::Apply).await?;
        let outcome = self
            .add_stock(&mut tx, &product.sku, request.quantity)
            .await
            .map(StageOutcome::Commit);
        let inventory = self.finish(tx, OP, Stage::Apply, outcome).await?;
        info!(available = inventory.available, "production applied");

        match self.publish_inventory(&inventory).await {
            Ok(()) => Ok(()),
            Err(source) => Err(publish_failed(OP, Committed::Inventory(inventory), source)),
        }
    }

    /// Reserve stock for a requester.
    ///
    /// The reservation is recorded `Open` and stock is taken right away when
    /// enough is available; otherwise the reservation waits for stock and
    /// inventory is left untouched. Replaying a request returns the stored
    /// reservation.
    #[instrument(
        name = "reserve",
        skip_all,
        fields(
            sku = %request.sku,
            request_id = %request.request_id,
            requester = %request.requester,
            quantity = request.quantity
        )
    )]
    pub async fn reserve(&self, request: ReservationRequest) -> Result<Reservation, InventoryError> {
        const OP: Operation = Operation::Reserve;

        let request = request.validate().inspect_err(|err| {
            debug!(error = %err, "reservation request rejected");
        })?;

        let mut tx = self.begin(OP, Stage::Record).await?;
        let outcome = self.record_reservation(&mut tx, &request).await;
        let reservation = match self.finish(tx, OP, Stage::Record, outcome).await? {
            Recorded::Created(reservation) => reservation,
            Recorded::Existing(reservation) => {
                info!("reservation already recorded");
                return Ok(reservation);
            }
            Recorded::Raced => {
                info!("reservation recorded by a concurrent request");
                return self
                    .repository
                    .get_reservation_by_request_id(&request.request_id, None)
                    .await
                    .map_err(|err| InventoryError::storage(OP, Stage::IdempotencyCheck, err));
            }
        };

        let mut tx = self.begin(OP, Stage::Apply).await?;
        let outcome = self
            .allocate(&mut tx, &reservation)
            .await
            .map(StageOutcome::Commit);
        let allocated = self.finish(tx, OP, Stage::Apply, outcome).await?;

        let reservation_published = self.publish_reservation(&reservation).await;
        let inventory_published = match &allocated {
            Some(inventory) => self.publish_inventory(inventory).await,
            None => Ok(()),
        };
        match reservation_published.and(inventory_published) {
            Ok(()) => Ok(reservation),
            Err(source) => Err(publish_failed(OP, Committed::Reservation(reservation), source)),
        }
    }

    #[instrument(skip_all, fields(sku = %sku))]
    pub async fn get_product(&self, sku: &Sku) -> Result<Product, InventoryError> {
        self.repository
            .get_product(sku, None)
            .await
            .map_err(|err| match err {
                RepositoryError::NotFound => InventoryError::ProductNotFound(sku.to_string()),
                err => InventoryError::storage(Operation::GetProduct, Stage::Read, err),
            })
    }

    #[instrument(skip_all, fields(sku = %sku))]
    pub async fn get_product_inventory(&self, sku: &Sku) -> Result<ProductInventory, InventoryError> {
        self.repository
            .get_product_inventory(sku, None)
            .await
            .map_err(|err| match err {
                RepositoryError::NotFound => InventoryError::InventoryNotFound(sku.to_string()),
                err => InventoryError::storage(Operation::GetProductInventory, Stage::Read, err),
            })
    }

    /// One page of inventory rows, ordered by sku.
    #[instrument(skip(self))]
    pub async fn get_all_product_inventory(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ProductInventory>, InventoryError> {
        self.repository
            .get_all_product_inventory(Pagination { limit, offset })
            .await
            .map_err(|err| InventoryError::storage(Operation::GetAllProductInventory, Stage::Read, err))
    }

    async fn insert_product(
        &self,
        tx: &mut R::Tx,
        product: &Product,
    ) -> Result<StageOutcome<bool>, InventoryError> {
        const OP: Operation = Operation::CreateProduct;

        match self.repository.save_product(tx, product).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => return Ok(StageOutcome::Discard(false)),
            Err(err) => return Err(InventoryError::storage(OP, Stage::Record, err)),
        }
        self.repository
            .save_product_inventory(tx, &ProductInventory::empty(product.clone()))
            .await
            .map_err(|err| InventoryError::storage(OP, Stage::Record, err))?;

        Ok(StageOutcome::Commit(true))
    }

    async fn add_stock(
        &self,
        tx: &mut R::Tx,
        sku: &Sku,
        quantity: i64,
    ) -> Result<ProductInventory, InventoryError> {
        const OP: Operation = Operation::Produce;

        let mut inventory = self.locked_inventory(tx, OP, sku).await?;
        inventory.produce(quantity)?;
        self.repository
            .save_product_inventory(tx, &inventory)
            .await
            .map_err(|err| InventoryError::storage(OP, Stage::Apply, err))?;

        Ok(inventory)
    }

    async fn record_reservation(
        &self,
        tx: &mut R::Tx,
        request: &ValidReservation,
    ) -> Result<StageOutcome<Recorded>, InventoryError> {
        const OP: Operation = Operation::Reserve;

        match self.repository.get_product(&request.sku, Some(&mut *tx)).await {
            Ok(_) => {}
            Err(RepositoryError::NotFound) => {
                return Err(InventoryError::ProductNotFound(request.sku.to_string()));
            }
            Err(err) => return Err(InventoryError::storage(OP, Stage::Record, err)),
        }

        match self
            .repository
            .get_reservation_by_request_id(&request.request_id, Some(&mut *tx))
            .await
        {
            Ok(existing) => return Ok(StageOutcome::Discard(Recorded::Existing(existing))),
            Err(RepositoryError::NotFound) => {}
            Err(err) => return Err(InventoryError::storage(OP, Stage::IdempotencyCheck, err)),
        }

        let reservation = Reservation::open(request.clone(), Utc::now());
        match self.repository.save_reservation(tx, &reservation).await {
            Ok(()) => Ok(StageOutcome::Commit(Recorded::Created(reservation))),
            Err(RepositoryError::Conflict(_)) => Ok(StageOutcome::Discard(Recorded::Raced)),
            Err(err) => Err(InventoryError::storage(OP, Stage::Record, err)),
        }
    }

    /// Take the reserved quantity out of stock if it is all there.
    async fn allocate(
        &self,
        tx: &mut R::Tx,
        reservation: &Reservation,
    ) -> Result<Option<ProductInventory>, InventoryError> {
        const OP: Operation = Operation::Reserve;

        let mut inventory = self.locked_inventory(tx, OP, &reservation.sku).await?;
        if !inventory.try_allocate(reservation.quantity) {
            info!(
                available = inventory.available,
                "not enough stock; reservation stays open"
            );
            return Ok(None);
        }
        self.repository
            .save_product_inventory(tx, &inventory)
            .await
            .map_err(|err| InventoryError::storage(OP, Stage::Apply, err))?;

        info!(available = inventory.available, "stock reserved");
        Ok(Some(inventory))
    }

    async fn locked_inventory(
        &self,
        tx: &mut R::Tx,
        operation: Operation,
        sku: &Sku,
    ) -> Result<ProductInventory, InventoryError> {
        match self.repository.get_product_inventory(sku, Some(tx)).await {
            Ok(inventory) => Ok(inventory),
            Err(RepositoryError::NotFound) => Err(InventoryError::InventoryNotFound(sku.to_string())),
            Err(err) => Err(InventoryError::storage(operation, Stage::Apply, err)),
        }
    }

    async fn begin(&self, operation: Operation, stage: Stage) -> Result<R::Tx, InventoryError> {
        debug!(%stage, "beginning transaction");
        self.repository
            .begin_transaction()
            .await
            .map_err(|source| InventoryError::Transaction {
                operation,
                stage,
                source,
            })
    }

    /// End a stage: commit or roll back depending on the body's outcome.
    ///
    /// A failed commit is followed by a rollback. A rollback that fails after
    /// another error is only logged; the first error is returned.
    async fn finish<T>(
        &self,
        mut tx: R::Tx,
        operation: Operation,
        stage: Stage,
        outcome: Result<StageOutcome<T>, InventoryError>,
    ) -> Result<T, InventoryError> {
        match outcome {
            Ok(StageOutcome::Commit(value)) => match tx.commit().await {
                Ok(()) => {
                    debug!(%stage, "transaction committed");
                    Ok(value)
                }
                Err(source) => {
                    warn!(%stage, error = %source, "commit failed");
                    rollback_after_failure(&mut tx, stage).await;
                    Err(InventoryError::Transaction {
                        operation,
                        stage,
                        source,
                    })
                }
            },
            Ok(StageOutcome::Discard(value)) => {
                tx.rollback()
                    .await
                    .map_err(|source| InventoryError::Transaction {
                        operation,
                        stage,
                        source,
                    })?;
                debug!(%stage, "nothing to write; transaction rolled back");
                Ok(value)
            }
            Err(err) => {
                rollback_after_failure(&mut tx, stage).await;
                Err(err)
            }
        }
    }

    async fn publish_inventory(&self, inventory: &ProductInventory) -> Result<(), PublishError> {
        let timeout = self.config.publish_timeout;
        tokio::time::timeout(timeout, self.publisher.publish_inventory(inventory))
            .await
            .unwrap_or_else(|_| Err(PublishError::Timeout(timeout)))
    }

    async fn publish_reservation(&self, reservation: &Reservation) -> Result<(), PublishError> {
        let timeout = self.config.publish_timeout;
        tokio::time::timeout(timeout, self.publisher.publish_reservation(reservation))
            .await
            .unwrap_or_else(|_| Err(PublishError::Timeout(timeout)))
    }
}

async fn rollback_after_failure<T: Transaction>(tx: &mut T, stage: Stage) {
    match tx.rollback().await {
        Ok(()) => debug!(%stage, "transaction rolled back"),
        Err(err) => warn!(%stage, error = %err, "rollback failed"),
    }
}

fn publish_failed(operation: Operation, committed: Committed, source: PublishError) -> InventoryError {
    warn!(error = %source, "change committed but notification was not published");
    InventoryError::publish(operation, committed, source)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use proptest::prelude::*;

    use stockflow_core::{RequestId, Sku};

    use super::*;
    use crate::model::ReserveState;
    use crate::testing::{Call, RecordingPublisher, RecordingRepository};

    const SKU: &str = "productsku";

    type TestService = InventoryService<RecordingRepository, RecordingPublisher>;

    fn product() -> Product {
        Product::new(SKU, "productupc", "productname").unwrap()
    }

    fn stocked(available: i64) -> ProductInventory {
        ProductInventory {
            product: product(),
            available,
        }
    }

    fn setup(repo: &RecordingRepository) -> (TestService, RecordingPublisher) {
        let publisher = RecordingPublisher::new();
        (
            InventoryService::new(repo.clone(), publisher.clone()),
            publisher,
        )
    }

    fn stocked_repo(available: i64) -> RecordingRepository {
        RecordingRepository::new()
            .with_product(product())
            .with_inventory(stocked(available))
    }

    fn storage_failure() -> RepositoryError {
        RepositoryError::storage("connection reset")
    }

    // --- create_product ---

    #[tokio::test]
    async fn create_product_persists_product_and_empty_inventory() {
        let repo = RecordingRepository::new();
        let (service, _) = setup(&repo);

        service.create_product(product()).await.unwrap();

        assert_eq!(repo.calls(Call::SaveProduct), 1);
        assert_eq!(repo.calls(Call::SaveProductInventory), 1);
        assert_eq!(repo.calls(Call::Commit), 1);
        assert_eq!(repo.calls(Call::Rollback), 0);
        assert_eq!(repo.product(SKU), Some(product()));
        assert_eq!(repo.inventory(SKU).unwrap().available, 0);
    }

    #[tokio::test]
    async fn create_product_twice_writes_once() {
        let repo = RecordingRepository::new();
        let (service, _) = setup(&repo);

        service.create_product(product()).await.unwrap();
        service.create_product(product()).await.unwrap();

        assert_eq!(repo.calls(Call::SaveProduct), 1);
        assert_eq!(repo.calls(Call::SaveProductInventory), 1);
        assert_eq!(repo.calls(Call::BeginTransaction), 1);
    }

    #[tokio::test]
    async fn create_product_surfaces_lookup_failure() {
        let repo = RecordingRepository::new();
        repo.fail(Call::GetProduct, storage_failure());
        let (service, _) = setup(&repo);

        let err = service.create_product(product()).await.unwrap_err();

        assert!(matches!(
            err,
            InventoryError::Storage {
                operation: Operation::CreateProduct,
                stage: Stage::IdempotencyCheck,
                ..
            }
        ));
        assert_eq!(repo.saves(), 0);
        assert_eq!(repo.calls(Call::BeginTransaction), 0);
    }

    #[tokio::test]
    async fn create_product_rolls_back_when_a_save_fails() {
        for failing in [Call::SaveProduct, Call::SaveProductInventory] {
            let repo = RecordingRepository::new();
            repo.fail(failing, storage_failure());
            let (service, _) = setup(&repo);

            let err = service.create_product(product()).await.unwrap_err();

            assert!(matches!(err, InventoryError::Storage { stage: Stage::Record, .. }), "{failing:?}");
            assert_eq!(repo.calls(Call::Commit), 0, "{failing:?}");
            assert_eq!(repo.calls(Call::Rollback), 1, "{failing:?}");
            assert_eq!(repo.product(SKU), None, "{failing:?}");
            assert_eq!(repo.inventory(SKU), None, "{failing:?}");
        }
    }

    #[tokio::test]
    async fn create_product_surfaces_begin_failure() {
        let repo = RecordingRepository::new();
        repo.fail(Call::BeginTransaction, RepositoryError::transaction("pool exhausted"));
        let (service, _) = setup(&repo);

        let err = service.create_product(product()).await.unwrap_err();

        assert!(matches!(err, InventoryError::Transaction { stage: Stage::Record, .. }));
        assert_eq!(repo.saves(), 0);
    }

    #[tokio::test]
    async fn create_product_rolls_back_after_failed_commit() {
        let repo = RecordingRepository::new();
        repo.fail(Call::Commit, RepositoryError::transaction("serialization failure"));
        let (service, _) = setup(&repo);

        let err = service.create_product(product()).await.unwrap_err();

        assert!(matches!(err, InventoryError::Transaction { .. }));
        assert_eq!(repo.calls(Call::Rollback), 1);
        assert_eq!(repo.product(SKU), None);
    }

    #[tokio::test]
    async fn create_product_losing_a_race_is_success() {
        let repo = RecordingRepository::new();
        repo.fail(Call::SaveProduct, RepositoryError::conflict("duplicate key"));
        let (service, _) = setup(&repo);

        service.create_product(product()).await.unwrap();

        assert_eq!(repo.calls(Call::SaveProductInventory), 0);
        assert_eq!(repo.calls(Call::Commit), 0);
        assert_eq!(repo.calls(Call::Rollback), 1);
    }

    #[tokio::test]
    async fn rollback_failure_does_not_hide_the_original_error() {
        let repo = RecordingRepository::new();
        repo.fail(Call::SaveProduct, storage_failure());
        repo.fail(Call::Rollback, RepositoryError::transaction("connection lost"));
        let (service, _) = setup(&repo);

        let err = service.create_product(product()).await.unwrap_err();

        assert!(matches!(
            err,
            InventoryError::Storage {
                source: RepositoryError::Storage(_),
                ..
            }
        ));
    }

    // --- produce ---

    #[tokio::test]
    async fn produce_adds_stock_and_publishes() {
        let repo = stocked_repo(1);
        let (service, publisher) = setup(&repo);

        service
            .produce(product(), ProductionRequest::new("r1", 1))
            .await
            .unwrap();

        assert_eq!(repo.inventory(SKU).unwrap().available, 2);
        assert_eq!(repo.calls(Call::SaveProductionEvent), 1);
        assert_eq!(repo.calls(Call::SaveProductInventory), 1);
        assert_eq!(repo.calls(Call::Commit), 2);
        assert_eq!(repo.calls(Call::Rollback), 0);
        assert_eq!(publisher.inventory(), vec![stocked(2)]);

        let events = repo.production_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_id.as_str(), "r1");
        assert_eq!(events[0].quantity, 1);
    }

    #[tokio::test]
    async fn produce_rejects_invalid_requests_without_touching_storage() {
        for request in [
            ProductionRequest::new("r1", 0),
            ProductionRequest::new("r1", -3),
            ProductionRequest::new("", 1),
            ProductionRequest::new("  ", 1),
        ] {
            let repo = stocked_repo(1);
            let (service, publisher) = setup(&repo);

            let err = service.produce(product(), request.clone()).await.unwrap_err();

            assert!(err.is_validation(), "{request:?}");
            assert_eq!(repo.calls(Call::GetProductionEventByRequestId), 0);
            assert_eq!(repo.calls(Call::BeginTransaction), 0);
            assert_eq!(repo.saves(), 0);
            assert!(publisher.inventory().is_empty());
        }
    }

    #[tokio::test]
    async fn produce_replay_applies_once() {
        let repo = stocked_repo(1);
        let (service, publisher) = setup(&repo);

        for _ in 0..2 {
            service
                .produce(product(), ProductionRequest::new("r1", 1))
                .await
                .unwrap();
        }

        assert_eq!(repo.inventory(SKU).unwrap().available, 2);
        assert_eq!(repo.production_events().len(), 1);
        assert_eq!(repo.calls(Call::SaveProductionEvent), 1);
        assert_eq!(repo.calls(Call::Commit), 2);
        assert_eq!(publisher.inventory().len(), 1);
    }

    #[tokio::test]
    async fn produce_skips_already_recorded_request() {
        let event = ProductionEvent::new(
            RequestId::new("r1").unwrap(),
            Sku::new(SKU).unwrap(),
            1,
            Utc::now(),
        );
        let repo = stocked_repo(1).with_production_event(event);
        let (service, _) = setup(&repo);

        service
            .produce(product(), ProductionRequest::new("r1", 1))
            .await
            .unwrap();

        assert_eq!(repo.saves(), 0);
        assert_eq!(repo.calls(Call::BeginTransaction), 0);
        assert_eq!(repo.inventory(SKU).unwrap().available, 1);
    }

    #[tokio::test]
    async fn produce_surfaces_idempotency_lookup_failure() {
        let repo = stocked_repo(1);
        repo.fail(Call::GetProductionEventByRequestId, storage_failure());
        let (service, _) = setup(&repo);

        let err = service
            .produce(product(), ProductionRequest::new("r1", 1))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::IdempotencyCheck));
        assert_eq!(repo.saves(), 0);
    }

    #[tokio::test]
    async fn produce_record_failure_leaves_inventory_alone() {
        let repo = stocked_repo(1);
        repo.fail(Call::SaveProductionEvent, storage_failure());
        let (service, publisher) = setup(&repo);

        let err = service
            .produce(product(), ProductionRequest::new("r1", 1))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Record));
        assert_eq!(repo.calls(Call::Rollback), 1);
        assert_eq!(repo.calls(Call::BeginTransaction), 1);
        assert_eq!(repo.calls(Call::SaveProductInventory), 0);
        assert_eq!(repo.inventory(SKU).unwrap().available, 1);
        assert!(publisher.inventory().is_empty());
    }

    #[tokio::test]
    async fn produce_recorded_concurrently_is_success() {
        let repo = stocked_repo(1);
        repo.fail(Call::SaveProductionEvent, RepositoryError::conflict("duplicate key"));
        let (service, publisher) = setup(&repo);

        service
            .produce(product(), ProductionRequest::new("r1", 1))
            .await
            .unwrap();

        assert_eq!(repo.calls(Call::Commit), 0);
        assert_eq!(repo.calls(Call::Rollback), 1);
        assert_eq!(repo.calls(Call::SaveProductInventory), 0);
        assert_eq!(repo.inventory(SKU).unwrap().available, 1);
        assert!(publisher.inventory().is_empty());
    }

    #[tokio::test]
    async fn produce_apply_failure_keeps_the_recorded_request() {
        let repo = stocked_repo(1);
        repo.fail(Call::SaveProductInventory, storage_failure());
        let (service, publisher) = setup(&repo);

        let err = service
            .produce(product(), ProductionRequest::new("r1", 1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            InventoryError::Storage {
                operation: Operation::Produce,
                stage: Stage::Apply,
                ..
            }
        ));
        assert_eq!(repo.calls(Call::Commit), 1);
        assert_eq!(repo.calls(Call::Rollback), 1);
        assert_eq!(repo.production_events().len(), 1);
        assert_eq!(repo.inventory(SKU).unwrap().available, 1);
        assert!(publisher.inventory().is_empty());
    }

    #[tokio::test]
    async fn produce_apply_commit_failure_rolls_back() {
        let repo = stocked_repo(1);
        repo.fail_nth(Call::Commit, 2, RepositoryError::transaction("deadlock detected"));
        let (service, publisher) = setup(&repo);

        let err = service
            .produce(product(), ProductionRequest::new("r1", 1))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::Transaction { stage: Stage::Apply, .. }));
        assert_eq!(repo.calls(Call::Rollback), 1);
        assert_eq!(repo.production_events().len(), 1);
        assert_eq!(repo.inventory(SKU).unwrap().available, 1);
        assert!(publisher.inventory().is_empty());
    }

    #[tokio::test]
    async fn produce_surfaces_begin_failure() {
        let repo = stocked_repo(1);
        repo.fail(Call::BeginTransaction, RepositoryError::transaction("pool exhausted"));
        let (service, publisher) = setup(&repo);

        let err = service
            .produce(product(), ProductionRequest::new("r1", 1))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::Transaction { stage: Stage::Record, .. }));
        assert_eq!(repo.calls(Call::Commit), 0);
        assert_eq!(repo.calls(Call::Rollback), 0);
        assert_eq!(repo.saves(), 0);
        assert!(repo.production_events().is_empty());
        assert!(publisher.inventory().is_empty());
    }

    #[tokio::test]
    async fn produce_record_commit_failure_rolls_back() {
        let repo = stocked_repo(1);
        repo.fail_nth(Call::Commit, 1, RepositoryError::transaction("could not serialize access"));
        let (service, publisher) = setup(&repo);

        let err = service
            .produce(product(), ProductionRequest::new("r1", 1))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::Transaction { stage: Stage::Record, .. }));
        assert_eq!(repo.calls(Call::BeginTransaction), 1);
        assert_eq!(repo.calls(Call::Commit), 1);
        assert_eq!(repo.calls(Call::Rollback), 1);
        assert!(repo.production_events().is_empty());
        assert_eq!(repo.inventory(SKU).unwrap().available, 1);
        assert!(publisher.inventory().is_empty());
    }

    #[tokio::test]
    async fn produce_without_inventory_row_fails_in_apply_stage() {
        let repo = RecordingRepository::new().with_product(product());
        let (service, _) = setup(&repo);

        let err = service
            .produce(product(), ProductionRequest::new("r1", 1))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::InventoryNotFound(ref sku) if sku == SKU));
        assert!(err.is_not_found());
        assert_eq!(repo.production_events().len(), 1);
        assert_eq!(repo.calls(Call::Rollback), 1);
    }

    #[tokio::test]
    async fn produce_overflow_is_rejected_in_apply_stage() {
        let repo = stocked_repo(i64::MAX);
        let (service, _) = setup(&repo);

        let err = service
            .produce(product(), ProductionRequest::new("r1", 1))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::Invariant(_)));
        assert_eq!(repo.calls(Call::SaveProductInventory), 0);
        assert_eq!(repo.inventory(SKU).unwrap().available, i64::MAX);
    }

    #[tokio::test]
    async fn produce_publish_failure_is_a_warning() {
        let repo = stocked_repo(1);
        let (service, publisher) = setup(&repo);
        publisher.fail_inventory(PublishError::Transport("broker unavailable".into()));

        let err = service
            .produce(product(), ProductionRequest::new("r1", 1))
            .await
            .unwrap_err();

        assert!(err.is_warning());
        assert_eq!(err.committed(), Some(&Committed::Inventory(stocked(2))));
        assert_eq!(repo.inventory(SKU).unwrap().available, 2);
        assert_eq!(repo.calls(Call::Rollback), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_publisher_times_out() {
        let repo = stocked_repo(1);
        let publisher = RecordingPublisher::new();
        publisher.delay(Duration::from_secs(60));
        let service = InventoryService::with_config(
            repo.clone(),
            publisher,
            ServiceConfig {
                publish_timeout: Duration::from_millis(100),
            },
        );

        let err = service
            .produce(product(), ProductionRequest::new("r1", 1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            InventoryError::Publish {
                source: PublishError::Timeout(_),
                ..
            }
        ));
        assert_eq!(repo.inventory(SKU).unwrap().available, 2);
    }

    // --- reserve ---

    #[tokio::test]
    async fn reserve_records_open_reservation_and_takes_stock() {
        let repo = stocked_repo(5);
        let (service, publisher) = setup(&repo);

        let reservation = service
            .reserve(ReservationRequest::new("r1", SKU, "user1", 2))
            .await
            .unwrap();

        assert_eq!(reservation.state, ReserveState::Open);
        assert_eq!(reservation.request_id.as_str(), "r1");
        assert_eq!(reservation.requester, "user1");
        assert_eq!(reservation.quantity, 2);
        assert_eq!(repo.calls(Call::SaveReservation), 1);
        assert_eq!(repo.calls(Call::Commit), 2);
        assert_eq!(repo.inventory(SKU).unwrap().available, 3);
        assert_eq!(publisher.reservations(), vec![reservation]);
        assert_eq!(publisher.inventory(), vec![stocked(3)]);
    }

    #[tokio::test]
    async fn reserve_without_enough_stock_stays_open() {
        let repo = stocked_repo(1);
        let (service, publisher) = setup(&repo);

        let reservation = service
            .reserve(ReservationRequest::new("r1", SKU, "user1", 2))
            .await
            .unwrap();

        assert_eq!(reservation.state, ReserveState::Open);
        assert_eq!(repo.calls(Call::Commit), 2);
        assert_eq!(repo.calls(Call::SaveProductInventory), 0);
        assert_eq!(repo.inventory(SKU).unwrap().available, 1);
        assert_eq!(publisher.reservations().len(), 1);
        assert!(publisher.inventory().is_empty());
    }

    #[tokio::test]
    async fn reserve_rejects_invalid_requests_without_touching_storage() {
        for request in [
            ReservationRequest::new("", SKU, "user1", 1),
            ReservationRequest::new("r1", "", "user1", 1),
            ReservationRequest::new("r1", SKU, "", 1),
            ReservationRequest::new("r1", SKU, "user1", 0),
            ReservationRequest::new("r1", SKU, "user1", -1),
        ] {
            let repo = stocked_repo(5);
            let (service, _) = setup(&repo);

            let err = service.reserve(request.clone()).await.unwrap_err();

            assert!(err.is_validation(), "{request:?}");
            assert_eq!(repo.calls(Call::BeginTransaction), 0);
            assert_eq!(repo.saves(), 0);
        }
    }

    #[tokio::test]
    async fn reserve_unknown_product_is_not_found() {
        let repo = RecordingRepository::new();
        let (service, _) = setup(&repo);

        let err = service
            .reserve(ReservationRequest::new("r1", SKU, "user1", 1))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::ProductNotFound(ref sku) if sku == SKU));
        assert_eq!(repo.calls(Call::Rollback), 1);
        assert_eq!(repo.calls(Call::SaveReservation), 0);
        assert!(repo.reservations().is_empty());
    }

    #[tokio::test]
    async fn reserve_replay_returns_the_stored_reservation() {
        let repo = stocked_repo(5);
        let (service, publisher) = setup(&repo);
        let request = ReservationRequest::new("r1", SKU, "user1", 2);

        let first = service.reserve(request.clone()).await.unwrap();
        let second = service.reserve(request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(repo.reservations().len(), 1);
        assert_eq!(repo.calls(Call::SaveReservation), 1);
        assert_eq!(repo.calls(Call::Rollback), 1);
        assert_eq!(repo.inventory(SKU).unwrap().available, 3);
        assert_eq!(publisher.reservations().len(), 1);
    }

    #[tokio::test]
    async fn reserve_losing_a_race_returns_the_winner() {
        let winner = Reservation::open(
            ReservationRequest::new("r1", SKU, "user2", 3).validate().unwrap(),
            Utc::now(),
        );
        let repo = stocked_repo(5).with_reservation(winner.clone());
        // The in-transaction lookup misses the winner, the insert then conflicts.
        repo.fail_nth(Call::GetReservationByRequestId, 1, RepositoryError::NotFound);
        let (service, publisher) = setup(&repo);

        let reservation = service
            .reserve(ReservationRequest::new("r1", SKU, "user1", 1))
            .await
            .unwrap();

        assert_eq!(reservation, winner);
        assert_eq!(repo.calls(Call::GetReservationByRequestId), 2);
        assert_eq!(repo.calls(Call::Rollback), 1);
        assert_eq!(repo.calls(Call::Commit), 0);
        assert_eq!(repo.inventory(SKU).unwrap().available, 5);
        assert!(publisher.reservations().is_empty());
    }

    #[tokio::test]
    async fn reserve_record_failures_roll_back() {
        for failing in [Call::GetProduct, Call::GetReservationByRequestId, Call::SaveReservation] {
            let repo = stocked_repo(5);
            repo.fail(failing, storage_failure());
            let (service, _) = setup(&repo);

            let err = service
                .reserve(ReservationRequest::new("r1", SKU, "user1", 1))
                .await
                .unwrap_err();

            assert!(matches!(err, InventoryError::Storage { .. }), "{failing:?}");
            assert_eq!(repo.calls(Call::Rollback), 1, "{failing:?}");
            assert_eq!(repo.calls(Call::Commit), 0, "{failing:?}");
            assert!(repo.reservations().is_empty(), "{failing:?}");
        }
    }

    #[tokio::test]
    async fn reserve_surfaces_begin_failure() {
        let repo = stocked_repo(5);
        repo.fail(Call::BeginTransaction, RepositoryError::transaction("pool exhausted"));
        let (service, publisher) = setup(&repo);

        let err = service
            .reserve(ReservationRequest::new("r1", SKU, "user1", 1))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::Transaction { stage: Stage::Record, .. }));
        assert_eq!(repo.calls(Call::Commit), 0);
        assert_eq!(repo.calls(Call::Rollback), 0);
        assert!(repo.reservations().is_empty());
        assert!(publisher.reservations().is_empty());
        assert!(publisher.inventory().is_empty());
    }

    #[tokio::test]
    async fn reserve_record_commit_failure_rolls_back() {
        let repo = stocked_repo(5);
        repo.fail_nth(Call::Commit, 1, RepositoryError::transaction("could not serialize access"));
        let (service, publisher) = setup(&repo);

        let err = service
            .reserve(ReservationRequest::new("r1", SKU, "user1", 1))
            .await
            .unwrap_err();

        assert!(matches!(err, InventoryError::Transaction { stage: Stage::Record, .. }));
        assert_eq!(repo.calls(Call::BeginTransaction), 1);
        assert_eq!(repo.calls(Call::Commit), 1);
        assert_eq!(repo.calls(Call::Rollback), 1);
        assert!(repo.reservations().is_empty());
        assert_eq!(repo.inventory(SKU).unwrap().available, 5);
        assert!(publisher.reservations().is_empty());
        assert!(publisher.inventory().is_empty());
    }

    #[tokio::test]
    async fn reserve_apply_failure_keeps_the_reservation() {
        let repo = stocked_repo(5);
        repo.fail(Call::SaveProductInventory, storage_failure());
        let (service, publisher) = setup(&repo);

        let err = service
            .reserve(ReservationRequest::new("r1", SKU, "user1", 2))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Apply));
        assert_eq!(repo.reservations().len(), 1);
        assert_eq!(repo.inventory(SKU).unwrap().available, 5);
        assert_eq!(repo.calls(Call::Commit), 1);
        assert_eq!(repo.calls(Call::Rollback), 1);
        assert!(publisher.reservations().is_empty());
    }

    #[tokio::test]
    async fn reserve_publish_failure_carries_the_reservation() {
        let repo = stocked_repo(5);
        let (service, publisher) = setup(&repo);
        publisher.fail_reservations(PublishError::Transport("broker unavailable".into()));

        let err = service
            .reserve(ReservationRequest::new("r1", SKU, "user1", 2))
            .await
            .unwrap_err();

        assert!(err.is_warning());
        let Some(Committed::Reservation(reservation)) = err.committed() else {
            panic!("expected a committed reservation, got {err:?}");
        };
        assert_eq!(repo.reservations(), vec![reservation.clone()]);
        assert_eq!(repo.inventory(SKU).unwrap().available, 3);
        // The inventory notification is still attempted.
        assert_eq!(publisher.inventory().len(), 1);
    }

    // --- reads ---

    #[tokio::test]
    async fn reads_map_missing_rows_to_not_found() {
        let repo = RecordingRepository::new();
        let (service, _) = setup(&repo);
        let sku = Sku::new(SKU).unwrap();

        assert!(matches!(
            service.get_product(&sku).await,
            Err(InventoryError::ProductNotFound(_))
        ));
        assert!(matches!(
            service.get_product_inventory(&sku).await,
            Err(InventoryError::InventoryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn reads_return_stored_rows() {
        let repo = stocked_repo(7);
        let (service, _) = setup(&repo);
        let sku = Sku::new(SKU).unwrap();

        assert_eq!(service.get_product(&sku).await.unwrap(), product());
        assert_eq!(service.get_product_inventory(&sku).await.unwrap().available, 7);
        assert_eq!(repo.calls(Call::BeginTransaction), 0);
    }

    #[tokio::test]
    async fn get_all_product_inventory_passes_pagination_through() {
        let mut repo = RecordingRepository::new();
        for sku in ["c", "a", "b"] {
            repo = repo.with_inventory(ProductInventory::empty(Product::new(sku, "upc", "name").unwrap()));
        }
        let (service, _) = setup(&repo);

        let page = service.get_all_product_inventory(2, 1).await.unwrap();
        let skus: Vec<_> = page.iter().map(|i| i.sku().as_str()).collect();

        assert_eq!(skus, vec!["b", "c"]);
        assert!(service.get_all_product_inventory(10, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_failures_are_tagged_with_the_read_stage() {
        let repo = RecordingRepository::new();
        repo.fail(Call::GetAllProductInventory, storage_failure());
        let (service, _) = setup(&repo);

        let err = service.get_all_product_inventory(10, 0).await.unwrap_err();

        assert_eq!(err.operation(), Some(Operation::GetAllProductInventory));
        assert_eq!(err.stage(), Some(Stage::Read));
    }

    proptest! {
        #[test]
        fn replayed_production_applies_exactly_once(quantity in 1i64..10_000, attempts in 1usize..5) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let repo = stocked_repo(0);
            let (service, publisher) = setup(&repo);
            runtime.block_on(async {
                for _ in 0..attempts {
                    service
                        .produce(product(), ProductionRequest::new("r1", quantity))
                        .await
                        .unwrap();
                }
            });

            prop_assert_eq!(repo.inventory(SKU).unwrap().available, quantity);
            prop_assert_eq!(repo.production_events().len(), 1);
            prop_assert_eq!(publisher.inventory().len(), 1);
        }

        #[test]
        fn reservations_never_overdraw_stock(available in 0i64..100, quantities in prop::collection::vec(1i64..50, 1..8)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let repo = stocked_repo(available);
            let (service, _) = setup(&repo);
            let reserved: i64 = runtime.block_on(async {
                let mut reserved = 0;
                for (i, quantity) in quantities.iter().enumerate() {
                    let request = ReservationRequest::new(format!("r{i}"), SKU, "user1", *quantity);
                    service.reserve(request).await.unwrap();
                    if reserved + quantity <= available {
                        reserved += quantity;
                    }
                }
                reserved
            });

            prop_assert_eq!(repo.inventory(SKU).unwrap().available, available - reserved);
            prop_assert_eq!(repo.reservations().len(), quantities.len());
        }
    }
}
