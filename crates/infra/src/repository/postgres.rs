//! Postgres-backed inventory repository.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE products (
//!     sku  TEXT PRIMARY KEY,
//!     upc  TEXT NOT NULL,
//!     name TEXT NOT NULL
//! );
//!
//! CREATE TABLE product_inventory (
//!     sku       TEXT PRIMARY KEY REFERENCES products (sku),
//!     available BIGINT NOT NULL CHECK (available >= 0)
//! );
//!
//! CREATE TABLE production_events (
//!     request_id TEXT PRIMARY KEY,
//!     sku        TEXT NOT NULL REFERENCES products (sku),
//!     quantity   BIGINT NOT NULL CHECK (quantity > 0),
//!     created    TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE reservations (
//!     request_id TEXT PRIMARY KEY,
//!     requester  TEXT NOT NULL,
//!     sku        TEXT NOT NULL REFERENCES products (sku),
//!     state      TEXT NOT NULL,
//!     quantity   BIGINT NOT NULL CHECK (quantity > 0),
//!     created    TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RepositoryError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key / check violation) | `23503` / `23514` | `Storage` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Transaction` |
//! | RowNotFound | N/A | `NotFound` |
//! | PoolClosed, PoolTimedOut | N/A | `Transaction` |
//! | Other | N/A | `Storage` |
//!
//! Inventory rows read inside a transaction are locked with `FOR UPDATE`, so
//! concurrent stock changes on one sku serialise. An sqlx transaction that is
//! dropped without commit is rolled back by sqlx.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row};
use std::sync::Arc;
use tracing::instrument;

use async_trait::async_trait;

use stockflow_core::{RequestId, Sku};
use stockflow_inventory::{
    InventoryRepository, Pagination, Product, ProductInventory, ProductionEvent, RepositoryError,
    Reservation, ReserveState, Transaction,
};

use crate::config::PostgresConfig;

/// Transaction over a [`PostgresInventoryRepository`].
pub struct PgTransaction {
    inner: Option<sqlx::Transaction<'static, Postgres>>,
}

impl core::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PgTransaction")
            .field("open", &self.inner.is_some())
            .finish()
    }
}

impl PgTransaction {
    fn connection(&mut self) -> Result<&mut PgConnection, RepositoryError> {
        match self.inner.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(RepositoryError::transaction("transaction already finished")),
        }
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(&mut self) -> Result<(), RepositoryError> {
        let tx = self
            .inner
            .take()
            .ok_or_else(|| RepositoryError::transaction("transaction already finished"))?;
        tx.commit().await.map_err(|e| map_commit_error("commit", e))
    }

    async fn rollback(&mut self) -> Result<(), RepositoryError> {
        match self.inner.take() {
            Some(tx) => tx.rollback().await.map_err(|e| map_commit_error("rollback", e)),
            None => Ok(()),
        }
    }
}

/// Postgres-backed [`InventoryRepository`].
///
/// Uses the SQLx connection pool, which is `Send + Sync`; clones share it.
#[derive(Debug, Clone)]
pub struct PostgresInventoryRepository {
    pool: Arc<PgPool>,
}

impl PostgresInventoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool from configuration.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl InventoryRepository for PostgresInventoryRepository {
    type Tx = PgTransaction;

    #[instrument(skip(self), err)]
    async fn begin_transaction(&self) -> Result<Self::Tx, RepositoryError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_commit_error("begin_transaction", e))?;
        Ok(PgTransaction { inner: Some(tx) })
    }

    #[instrument(skip(self, tx), fields(sku = %sku), err)]
    async fn get_product(
        &self,
        sku: &Sku,
        tx: Option<&mut Self::Tx>,
    ) -> Result<Product, RepositoryError> {
        let query = sqlx::query("SELECT sku, upc, name FROM products WHERE sku = $1")
            .bind(sku.as_str());
        let row = match tx {
            Some(tx) => query.fetch_optional(tx.connection()?).await,
            None => query.fetch_optional(&*self.pool).await,
        }
        .map_err(|e| map_sqlx_error("get_product", e))?
        .ok_or(RepositoryError::NotFound)?;

        decode::<ProductRow, _>(&row)
    }

    #[instrument(skip(self, tx, product), fields(sku = %product.sku), err)]
    async fn save_product(
        &self,
        tx: &mut Self::Tx,
        product: &Product,
    ) -> Result<(), RepositoryError> {
        sqlx::query("INSERT INTO products (sku, upc, name) VALUES ($1, $2, $3)")
            .bind(product.sku.as_str())
            .bind(&product.upc)
            .bind(&product.name)
            .execute(tx.connection()?)
            .await
            .map_err(|e| map_sqlx_error("save_product", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx), fields(sku = %sku, locked = tx.is_some()), err)]
    async fn get_product_inventory(
        &self,
        sku: &Sku,
        tx: Option<&mut Self::Tx>,
    ) -> Result<ProductInventory, RepositoryError> {
        const SELECT: &str = r#"
            SELECT p.sku, p.upc, p.name, i.available
            FROM product_inventory i
            JOIN products p ON p.sku = i.sku
            WHERE i.sku = $1
        "#;

        let row = match tx {
            Some(tx) => {
                let sql = format!("{SELECT} FOR UPDATE OF i");
                sqlx::query(&sql)
                    .bind(sku.as_str())
                    .fetch_optional(tx.connection()?)
                    .await
            }
            None => {
                sqlx::query(SELECT)
                    .bind(sku.as_str())
                    .fetch_optional(&*self.pool)
                    .await
            }
        }
        .map_err(|e| map_sqlx_error("get_product_inventory", e))?
        .ok_or(RepositoryError::NotFound)?;

        decode::<InventoryRow, _>(&row)
    }

    #[instrument(
        skip(self, tx, inventory),
        fields(sku = %inventory.product.sku, available = inventory.available),
        err
    )]
    async fn save_product_inventory(
        &self,
        tx: &mut Self::Tx,
        inventory: &ProductInventory,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO product_inventory (sku, available)
            VALUES ($1, $2)
            ON CONFLICT (sku) DO UPDATE SET available = EXCLUDED.available
            "#,
        )
        .bind(inventory.product.sku.as_str())
        .bind(inventory.available)
        .execute(tx.connection()?)
        .await
        .map_err(|e| map_sqlx_error("save_product_inventory", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_all_product_inventory(
        &self,
        page: Pagination,
    ) -> Result<Vec<ProductInventory>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT p.sku, p.upc, p.name, i.available
            FROM product_inventory i
            JOIN products p ON p.sku = i.sku
            ORDER BY i.sku ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_all_product_inventory", e))?;

        rows.iter().map(decode::<InventoryRow, _>).collect()
    }

    #[instrument(skip(self, tx), fields(request_id = %request_id), err)]
    async fn get_production_event_by_request_id(
        &self,
        request_id: &RequestId,
        tx: Option<&mut Self::Tx>,
    ) -> Result<ProductionEvent, RepositoryError> {
        let query = sqlx::query(
            "SELECT request_id, sku, quantity, created FROM production_events WHERE request_id = $1",
        )
        .bind(request_id.as_str());
        let row = match tx {
            Some(tx) => query.fetch_optional(tx.connection()?).await,
            None => query.fetch_optional(&*self.pool).await,
        }
        .map_err(|e| map_sqlx_error("get_production_event_by_request_id", e))?
        .ok_or(RepositoryError::NotFound)?;

        decode::<ProductionEventRow, _>(&row)
    }

    #[instrument(skip(self, tx, event), fields(request_id = %event.request_id), err)]
    async fn save_production_event(
        &self,
        tx: &mut Self::Tx,
        event: &ProductionEvent,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO production_events (request_id, sku, quantity, created)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.request_id.as_str())
        .bind(event.sku.as_str())
        .bind(event.quantity)
        .bind(event.created)
        .execute(tx.connection()?)
        .await
        .map_err(|e| map_sqlx_error("save_production_event", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx), fields(request_id = %request_id), err)]
    async fn get_reservation_by_request_id(
        &self,
        request_id: &RequestId,
        tx: Option<&mut Self::Tx>,
    ) -> Result<Reservation, RepositoryError> {
        let query = sqlx::query(
            r#"
            SELECT request_id, requester, sku, state, quantity, created
            FROM reservations
            WHERE request_id = $1
            "#,
        )
        .bind(request_id.as_str());
        let row = match tx {
            Some(tx) => query.fetch_optional(tx.connection()?).await,
            None => query.fetch_optional(&*self.pool).await,
        }
        .map_err(|e| map_sqlx_error("get_reservation_by_request_id", e))?
        .ok_or(RepositoryError::NotFound)?;

        decode::<ReservationRow, _>(&row)
    }

    #[instrument(skip(self, tx, reservation), fields(request_id = %reservation.request_id), err)]
    async fn save_reservation(
        &self,
        tx: &mut Self::Tx,
        reservation: &Reservation,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO reservations (request_id, requester, sku, state, quantity, created)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(reservation.request_id.as_str())
        .bind(&reservation.requester)
        .bind(reservation.sku.as_str())
        .bind(reservation.state.as_str())
        .bind(reservation.quantity)
        .bind(reservation.created)
        .execute(tx.connection()?)
        .await
        .map_err(|e| map_sqlx_error("save_reservation", e))?;
        Ok(())
    }
}

/// Map SQLx errors to repository errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => RepositoryError::Conflict(msg),
                Some("40001") | Some("40P01") => RepositoryError::Transaction(msg),
                _ => RepositoryError::Storage(msg),
            }
        }
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            RepositoryError::Transaction(format!("connection pool unavailable in {operation}: {err}"))
        }
        _ => RepositoryError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Begin, commit and rollback failures are always transaction errors.
fn map_commit_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match map_sqlx_error(operation, err) {
        RepositoryError::Transaction(msg)
        | RepositoryError::Storage(msg)
        | RepositoryError::Conflict(msg) => RepositoryError::Transaction(msg),
        RepositoryError::NotFound => {
            RepositoryError::Transaction(format!("unexpected row not found in {operation}"))
        }
    }
}

fn decode<'r, R, T>(row: &'r PgRow) -> Result<T, RepositoryError>
where
    R: FromRow<'r, PgRow> + TryInto<T, Error = RepositoryError>,
{
    R::from_row(row)
        .map_err(|e| RepositoryError::storage(format!("failed to decode row: {e}")))?
        .try_into()
}

fn invalid_row(err: impl core::fmt::Display) -> RepositoryError {
    RepositoryError::storage(format!("invalid stored row: {err}"))
}

// SQLx row types

#[derive(Debug)]
struct ProductRow {
    sku: String,
    upc: String,
    name: String,
}

impl<'r> FromRow<'r, PgRow> for ProductRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProductRow {
            sku: row.try_get("sku")?,
            upc: row.try_get("upc")?,
            name: row.try_get("name")?,
        })
    }
}

impl TryFrom<ProductRow> for Product {
    type Error = RepositoryError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        Product::new(row.sku, row.upc, row.name).map_err(invalid_row)
    }
}

#[derive(Debug)]
struct InventoryRow {
    product: ProductRow,
    available: i64,
}

impl<'r> FromRow<'r, PgRow> for InventoryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(InventoryRow {
            product: ProductRow::from_row(row)?,
            available: row.try_get("available")?,
        })
    }
}

impl TryFrom<InventoryRow> for ProductInventory {
    type Error = RepositoryError;

    fn try_from(row: InventoryRow) -> Result<Self, Self::Error> {
        Ok(ProductInventory {
            product: row.product.try_into()?,
            available: row.available,
        })
    }
}

#[derive(Debug)]
struct ProductionEventRow {
    request_id: String,
    sku: String,
    quantity: i64,
    created: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ProductionEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProductionEventRow {
            request_id: row.try_get("request_id")?,
            sku: row.try_get("sku")?,
            quantity: row.try_get("quantity")?,
            created: row.try_get("created")?,
        })
    }
}

impl TryFrom<ProductionEventRow> for ProductionEvent {
    type Error = RepositoryError;

    fn try_from(row: ProductionEventRow) -> Result<Self, Self::Error> {
        Ok(ProductionEvent::new(
            RequestId::new(row.request_id).map_err(invalid_row)?,
            Sku::new(row.sku).map_err(invalid_row)?,
            row.quantity,
            row.created,
        ))
    }
}

#[derive(Debug)]
struct ReservationRow {
    request_id: String,
    requester: String,
    sku: String,
    state: String,
    quantity: i64,
    created: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ReservationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ReservationRow {
            request_id: row.try_get("request_id")?,
            requester: row.try_get("requester")?,
            sku: row.try_get("sku")?,
            state: row.try_get("state")?,
            quantity: row.try_get("quantity")?,
            created: row.try_get("created")?,
        })
    }
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = RepositoryError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        Ok(Reservation {
            request_id: RequestId::new(row.request_id).map_err(invalid_row)?,
            requester: row.requester,
            sku: Sku::new(row.sku).map_err(invalid_row)?,
            state: row.state.parse::<ReserveState>().map_err(invalid_row)?,
            quantity: row.quantity,
            created: row.created,
        })
    }
}
