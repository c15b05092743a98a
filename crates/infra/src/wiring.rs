//! Service wiring from configuration.
//!
//! `USE_PERSISTENT_STORES=false` (the default) wires the in-memory repository
//! and bus. `true` wires Postgres and Redis, which needs the `redis` feature;
//! without it the in-memory stores are used and a warning is logged.

use std::sync::Arc;

use thiserror::Error;

use stockflow_events::{InMemoryEventBus, NotificationEnvelope};
use stockflow_inventory::InventoryService;
#[cfg(feature = "redis")]
use stockflow_inventory::{PublishError, RepositoryError};

use crate::config::InfraConfig;
use crate::publisher::BusPublisher;
use crate::repository::InMemoryInventoryRepository;
#[cfg(feature = "redis")]
use crate::{publisher::RedisPublisher, repository::PostgresInventoryRepository};

pub type InMemoryBus = Arc<InMemoryEventBus<NotificationEnvelope>>;

pub type InMemoryInventoryService =
    InventoryService<InMemoryInventoryRepository, BusPublisher<InMemoryBus>>;

#[cfg(feature = "redis")]
pub type PersistentInventoryService =
    InventoryService<PostgresInventoryRepository, RedisPublisher>;

#[derive(Debug, Error)]
pub enum WiringError {
    #[cfg(feature = "redis")]
    #[error("failed to connect to postgres: {0}")]
    Postgres(#[source] RepositoryError),

    #[cfg(feature = "redis")]
    #[error("failed to connect to redis: {0}")]
    Redis(#[source] PublishError),

    #[error("persistent stores selected without postgres settings")]
    MissingPostgres,
}

/// The inventory service with whichever adapters the configuration picked.
#[derive(Debug, Clone)]
pub enum InventoryServices {
    InMemory {
        service: Arc<InMemoryInventoryService>,
        /// Subscribe here to observe notifications.
        bus: InMemoryBus,
    },
    #[cfg(feature = "redis")]
    Persistent {
        service: Arc<PersistentInventoryService>,
    },
}

pub async fn build_services(config: &InfraConfig) -> Result<InventoryServices, WiringError> {
    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            if config.postgres.is_none() {
                return Err(WiringError::MissingPostgres);
            }
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
            );
        }
    }

    Ok(build_in_memory_services(config))
}

pub fn build_in_memory_services(config: &InfraConfig) -> InventoryServices {
    let bus: InMemoryBus = Arc::new(InMemoryEventBus::new());
    let publisher = BusPublisher::with_topics(Arc::clone(&bus), config.topics.clone());
    let service = InventoryService::with_config(
        InMemoryInventoryRepository::new(),
        publisher,
        config.service_config(),
    );

    tracing::info!("inventory service wired with in-memory stores");
    InventoryServices::InMemory {
        service: Arc::new(service),
        bus,
    }
}

#[cfg(feature = "redis")]
async fn build_persistent_services(config: &InfraConfig) -> Result<InventoryServices, WiringError> {
    let postgres = config.postgres.as_ref().ok_or(WiringError::MissingPostgres)?;

    let repository = PostgresInventoryRepository::connect(postgres)
        .await
        .map_err(WiringError::Postgres)?;
    let publisher = RedisPublisher::connect(&config.redis_url, config.topics.clone())
        .await
        .map_err(WiringError::Redis)?;

    tracing::info!(
        max_connections = postgres.max_connections,
        "inventory service wired with postgres and redis"
    );
    Ok(InventoryServices::Persistent {
        service: Arc::new(InventoryService::with_config(
            repository,
            publisher,
            config.service_config(),
        )),
    })
}
