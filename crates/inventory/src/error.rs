//! Service-level error taxonomy.

use thiserror::Error;

use stockflow_core::DomainError;

use crate::model::{ProductInventory, Reservation};
use crate::publisher::PublishError;
use crate::repository::RepositoryError;

/// Service operation an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateProduct,
    Produce,
    Reserve,
    GetProduct,
    GetProductInventory,
    GetAllProductInventory,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateProduct => "create_product",
            Self::Produce => "produce",
            Self::Reserve => "reserve",
            Self::GetProduct => "get_product",
            Self::GetProductInventory => "get_product_inventory",
            Self::GetAllProductInventory => "get_all_product_inventory",
        }
    }
}

impl core::fmt::Display for Operation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step of an operation an error was raised from.
///
/// `Record` is the first transaction of a two-stage operation (or the only
/// one of `CreateProduct`), `Apply` the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Validation,
    IdempotencyCheck,
    Record,
    Apply,
    Publish,
    Read,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::IdempotencyCheck => "idempotency_check",
            Self::Record => "record",
            Self::Apply => "apply",
            Self::Publish => "publish",
            Self::Read => "read",
        }
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable result of an operation whose notification could not be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Committed {
    Inventory(ProductInventory),
    Reservation(Reservation),
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("product not found: {0}")]
    ProductNotFound(String),

    #[error("inventory not found for product: {0}")]
    InventoryNotFound(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("{operation} failed during {stage}: {source}")]
    Storage {
        operation: Operation,
        stage: Stage,
        #[source]
        source: RepositoryError,
    },

    #[error("{operation} transaction failed during {stage}: {source}")]
    Transaction {
        operation: Operation,
        stage: Stage,
        #[source]
        source: RepositoryError,
    },

    /// The change committed; only its notification was lost.
    #[error("{operation} committed but its notification was not published: {source}")]
    Publish {
        operation: Operation,
        committed: Box<Committed>,
        #[source]
        source: PublishError,
    },
}

impl InventoryError {
    /// Wrap a repository failure, keeping transaction failures apart.
    pub fn storage(operation: Operation, stage: Stage, source: RepositoryError) -> Self {
        match source {
            RepositoryError::Transaction(_) => Self::Transaction {
                operation,
                stage,
                source,
            },
            source => Self::Storage {
                operation,
                stage,
                source,
            },
        }
    }

    pub fn publish(operation: Operation, committed: Committed, source: PublishError) -> Self {
        Self::Publish {
            operation,
            committed: Box::new(committed),
            source,
        }
    }

    /// `true` when the requested change is durable and only the
    /// notification failed.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Publish { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ProductNotFound(_) | Self::InventoryNotFound(_))
    }

    /// The committed result carried by a publish failure.
    pub fn committed(&self) -> Option<&Committed> {
        match self {
            Self::Publish { committed, .. } => Some(committed.as_ref()),
            _ => None,
        }
    }

    pub fn operation(&self) -> Option<Operation> {
        match self {
            Self::Storage { operation, .. }
            | Self::Transaction { operation, .. }
            | Self::Publish { operation, .. } => Some(*operation),
            _ => None,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Storage { stage, .. } | Self::Transaction { stage, .. } => Some(*stage),
            Self::Publish { .. } => Some(Stage::Publish),
            Self::Validation(_) => Some(Stage::Validation),
            _ => None,
        }
    }
}

impl From<DomainError> for InventoryError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::InvariantViolation(msg) | DomainError::Conflict(msg) => {
                Self::Invariant(msg)
            }
            DomainError::NotFound => Self::Invariant("unexpected missing entity".to_string()),
        }
    }
}
