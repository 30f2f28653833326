//! Read-side helpers that need the injected clock or the stock policy.

use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::instrument;

use stockledger_core::{DomainError, ShopId};
use stockledger_inventory::InventoryId;
use stockledger_stock::{ExpirationStatus, LedgerReport, Product, ProductBatch, ProductKey};

use super::{ServiceResult, StockService};
use crate::store::{
    BatchFilter, InventoryReport, MovementFilter, MovementPage, Pagination, StockQuery, StockStore,
};

/// A batch with its expiry classification as of the report date.
#[derive(Debug, Clone, Serialize)]
pub struct BatchExpiry {
    pub batch: ProductBatch,
    pub days_until_expiration: i64,
    pub status: ExpirationStatus,
}

impl<S> StockService<S>
where
    S: StockStore + StockQuery,
{
    /// Active batches of the shop, earliest expiry first. With `within_days`,
    /// only batches expiring on or before today + `within_days` (expired
    /// ones included).
    #[instrument(skip_all, fields(shop_id = %shop_id, within_days = ?within_days), err)]
    pub async fn batch_expiry_report(
        &self,
        shop_id: ShopId,
        within_days: Option<u32>,
    ) -> ServiceResult<Vec<BatchExpiry>> {
        let today = self.clock.today();
        let until = within_days
            .map(|days| shift(today, days, true))
            .transpose()?;
        let filter = BatchFilter::for_shop(shop_id).expiring_between(None, until);
        Ok(self.classify(filter, today).await?)
    }

    /// Active batches whose expiry date is already past.
    #[instrument(skip_all, fields(shop_id = %shop_id), err)]
    pub async fn expired_batches(&self, shop_id: ShopId) -> ServiceResult<Vec<BatchExpiry>> {
        let today = self.clock.today();
        let filter =
            BatchFilter::for_shop(shop_id).expiring_between(None, Some(shift(today, 1, false)?));
        Ok(self.classify(filter, today).await?)
    }

    /// Active products at or below the configured low-stock threshold.
    #[instrument(skip_all, fields(shop_id = %shop_id), err)]
    pub async fn low_stock_products(&self, shop_id: ShopId) -> ServiceResult<Vec<Product>> {
        Ok(self
            .store
            .low_stock_products(shop_id, self.policy.low_stock_threshold)
            .await?)
    }

    #[instrument(skip_all, fields(key = %key), err)]
    pub async fn ledger_report(&self, key: ProductKey) -> ServiceResult<LedgerReport> {
        self.store
            .ledger_report(key)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("product {key}")).into())
    }

    #[instrument(skip_all, fields(shop_id = %shop_id, inventory_id = %inventory_id), err)]
    pub async fn inventory_report(
        &self,
        shop_id: ShopId,
        inventory_id: InventoryId,
    ) -> ServiceResult<InventoryReport> {
        self.store
            .inventory_report(shop_id, inventory_id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("inventory {inventory_id}")).into())
    }

    #[instrument(
        skip_all,
        fields(
            shop_id = %filter.shop_id,
            product_id = ?filter.product_id,
            limit = pagination.limit,
            offset = pagination.offset
        ),
        err
    )]
    pub async fn movements(
        &self,
        filter: MovementFilter,
        pagination: Pagination,
    ) -> ServiceResult<MovementPage> {
        Ok(self.store.movements(filter, pagination).await?)
    }

    async fn classify(
        &self,
        filter: BatchFilter,
        today: NaiveDate,
    ) -> Result<Vec<BatchExpiry>, crate::store::StoreError> {
        let mut batches = self.store.batches(filter).await?;
        batches.sort_by_key(ProductBatch::fefo_key);
        Ok(batches
            .into_iter()
            .map(|batch| BatchExpiry {
                days_until_expiration: batch.days_until_expiration(today),
                status: batch.expiration_status_with(self.policy.expiry, today),
                batch,
            })
            .collect())
    }
}

fn shift(date: NaiveDate, days: u32, forward: bool) -> ServiceResult<NaiveDate> {
    let days = Days::new(u64::from(days));
    let shifted = if forward {
        date.checked_add_days(days)
    } else {
        date.checked_sub_days(days)
    };
    shifted.ok_or_else(|| DomainError::invariant(format!("date {date} shifted out of range")).into())
}
