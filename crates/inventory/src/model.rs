//! Inventory data model.
//!
//! Persisted state (`Product`, `ProductInventory`, `ProductionEvent`,
//! `Reservation`) plus the request payloads the service accepts. Requests
//! carry raw strings and signed quantities exactly as received; they are
//! turned into typed values by `validate`, which is the only place input is
//! rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{DomainError, DomainResult, Entity, RequestId, Sku};

/// A catalog entry. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub sku: Sku,
    pub upc: String,
    pub name: String,
}

impl Product {
    pub fn new(
        sku: impl Into<String>,
        upc: impl Into<String>,
        name: impl Into<String>,
    ) -> DomainResult<Self> {
        Ok(Self {
            sku: Sku::new(sku)?,
            upc: upc.into(),
            name: name.into(),
        })
    }
}

impl Entity for Product {
    type Id = Sku;

    fn id(&self) -> &Self::Id {
        &self.sku
    }
}

/// Current availability of one product.
///
/// `available` never goes below zero at rest: reservations only take stock
/// that is there, and production only adds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInventory {
    pub product: Product,
    pub available: i64,
}

impl ProductInventory {
    /// Inventory row created alongside a new product.
    pub fn empty(product: Product) -> Self {
        Self {
            product,
            available: 0,
        }
    }

    pub fn sku(&self) -> &Sku {
        &self.product.sku
    }

    /// Add produced stock.
    pub fn produce(&mut self, quantity: i64) -> DomainResult<()> {
        stockflow_core::ensure_positive("quantity", quantity)?;
        self.available = self.available.checked_add(quantity).ok_or_else(|| {
            DomainError::invariant(format!(
                "available stock for {} would overflow (available {}, adding {quantity})",
                self.product.sku, self.available
            ))
        })?;
        Ok(())
    }

    /// Take `quantity` out of available stock if there is enough of it.
    ///
    /// Returns `false` and leaves the row untouched otherwise.
    pub fn try_allocate(&mut self, quantity: i64) -> bool {
        if quantity <= 0 || self.available < quantity {
            return false;
        }
        self.available -= quantity;
        true
    }
}

/// Durable record that a production request was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionEvent {
    pub request_id: RequestId,
    pub sku: Sku,
    pub quantity: i64,
    pub created: DateTime<Utc>,
}

impl ProductionEvent {
    pub fn new(request_id: RequestId, sku: Sku, quantity: i64, created: DateTime<Utc>) -> Self {
        Self {
            request_id,
            sku,
            quantity,
            created,
        }
    }
}

impl Entity for ProductionEvent {
    type Id = RequestId;

    fn id(&self) -> &Self::Id {
        &self.request_id
    }
}

/// Lifecycle state of a reservation.
///
/// Reservations are created `Open`. `Closed` is reserved for a fulfilment
/// process and only ever read back from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReserveState {
    #[default]
    Open,
    Closed,
}

impl ReserveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Closed => "Closed",
        }
    }
}

impl core::fmt::Display for ReserveState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ReserveState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Open" => Ok(Self::Open),
            "Closed" => Ok(Self::Closed),
            other => Err(DomainError::validation(format!(
                "unknown reservation state: {other}"
            ))),
        }
    }
}

/// A requester's claim on stock of one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub request_id: RequestId,
    pub requester: String,
    pub sku: Sku,
    pub state: ReserveState,
    pub quantity: i64,
    pub created: DateTime<Utc>,
}

impl Reservation {
    /// A freshly accepted reservation.
    pub fn open(request: ValidReservation, created: DateTime<Utc>) -> Self {
        Self {
            request_id: request.request_id,
            requester: request.requester,
            sku: request.sku,
            state: ReserveState::Open,
            quantity: request.quantity,
            created,
        }
    }
}

impl Entity for Reservation {
    type Id = RequestId;

    fn id(&self) -> &Self::Id {
        &self.request_id
    }
}

/// Request to add stock to a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionRequest {
    pub request_id: String,
    pub quantity: i64,
}

impl ProductionRequest {
    pub fn new(request_id: impl Into<String>, quantity: i64) -> Self {
        Self {
            request_id: request_id.into(),
            quantity,
        }
    }

    /// Check the quantity, then the idempotency key.
    pub fn validate(&self) -> DomainResult<RequestId> {
        stockflow_core::ensure_positive("quantity", self.quantity)?;
        RequestId::new(self.request_id.as_str())
    }
}

/// Request to reserve stock of a product for a requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub request_id: String,
    pub sku: String,
    pub requester: String,
    pub quantity: i64,
}

/// A reservation request whose fields passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidReservation {
    pub request_id: RequestId,
    pub sku: Sku,
    pub requester: String,
    pub quantity: i64,
}

impl ReservationRequest {
    pub fn new(
        request_id: impl Into<String>,
        sku: impl Into<String>,
        requester: impl Into<String>,
        quantity: i64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            sku: sku.into(),
            requester: requester.into(),
            quantity,
        }
    }

    pub fn validate(&self) -> DomainResult<ValidReservation> {
        let request_id = RequestId::new(self.request_id.as_str())?;
        let sku = Sku::new(self.sku.as_str())?;
        if self.requester.trim().is_empty() {
            return Err(DomainError::validation("requester must not be empty"));
        }
        stockflow_core::ensure_positive("quantity", self.quantity)?;

        Ok(ValidReservation {
            request_id,
            sku,
            requester: self.requester.clone(),
            quantity: self.quantity,
        })
    }
}
