//! Wiring: pick a store from configuration and assemble the service.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use stockledger_core::{RandomReferenceGenerator, SystemClock};

use crate::config::StockConfig;
use crate::service::StockService;
use crate::store::{InMemoryStockStore, PostgresStockStore, StockBackend};

/// Shared store handle used by the service and by read-side callers.
pub type SharedBackend = Arc<dyn StockBackend>;

/// Postgres when `database_url` is configured (schema created if missing),
/// the in-memory store otherwise.
pub async fn connect_store(config: &StockConfig) -> anyhow::Result<SharedBackend> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresStockStore::connect(url, config.max_connections)
                .await
                .context("failed to connect to Postgres")?;
            store
                .ensure_schema()
                .await
                .context("failed to create the stock schema")?;
            info!(max_connections = config.max_connections, "using Postgres stock store");
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set; using in-memory stock store");
            Ok(Arc::new(InMemoryStockStore::new()))
        }
    }
}

/// Install logging in the configured format, then build the service over
/// the configured store with the system clock and random document references.
pub async fn build_service(config: &StockConfig) -> anyhow::Result<StockService<SharedBackend>> {
    stockledger_observability::init_with(config.log_format);
    let store = connect_store(config).await?;
    Ok(StockService::new(
        store,
        Arc::new(SystemClock),
        Arc::new(RandomReferenceGenerator),
        config.policy,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MovementFilter, Pagination};
    use stockledger_core::ShopId;

    #[tokio::test]
    async fn without_database_url_the_store_is_in_memory() {
        let config = StockConfig::default();
        let service = build_service(&config).await.unwrap();

        let page = service
            .movements(MovementFilter::for_shop(ShopId::new()), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert!(!page.has_more);
    }
}
