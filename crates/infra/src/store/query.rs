//! Read-only reporting interface.
//!
//! Queries never lock and never write. Movement listings are paginated by
//! default; batch and product listings are bounded by the shop.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{PharmacyId, Quantity, ShopId};
use stockledger_inventory::{Inventory, InventoryId, InventoryStatus};
use stockledger_purchasing::{PurchaseOrder, PurchaseOrderId};
use stockledger_stock::{
    LedgerReport, MovementType, Product, ProductBatch, ProductId, ProductKey, StockMovement,
};
use stockledger_transfers::{StockTransfer, StockTransferId};

use super::r#trait::StoreError;

/// Pagination parameters for movement queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of movements to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for ledger queries. `shop_id` is mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementFilter {
    pub shop_id: ShopId,
    pub product_id: Option<ProductId>,
    pub movement_type: Option<MovementType>,
    pub reference: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub created_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub created_until: Option<DateTime<Utc>>,
}

impl MovementFilter {
    pub fn for_shop(shop_id: ShopId) -> Self {
        Self {
            shop_id,
            product_id: None,
            movement_type: None,
            reference: None,
            created_from: None,
            created_until: None,
        }
    }

    pub fn for_product(key: ProductKey) -> Self {
        Self {
            product_id: Some(key.product_id),
            ..Self::for_shop(key.shop_id)
        }
    }

    pub fn matches(&self, movement: &StockMovement) -> bool {
        movement.shop_id() == self.shop_id
            && self.product_id.is_none_or(|p| movement.product_id() == p)
            && self.movement_type.is_none_or(|t| movement.movement_type() == t)
            && self
                .reference
                .as_deref()
                .is_none_or(|r| movement.reference() == r)
            && self.created_from.is_none_or(|from| movement.created_at() >= from)
            && self.created_until.is_none_or(|until| movement.created_at() < until)
    }
}

/// Paginated movement query result, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementPage {
    pub movements: Vec<StockMovement>,
    /// Total number of movements matching the filter (across all pages).
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl MovementPage {
    pub(crate) fn new(movements: Vec<StockMovement>, total: u64, pagination: Pagination) -> Self {
        let seen = u64::from(pagination.offset) + movements.len() as u64;
        Self {
            has_more: seen < total,
            movements,
            total,
            pagination,
        }
    }
}

/// Filter criteria for batch queries; results come back in FEFO order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFilter {
    pub shop_id: ShopId,
    pub product_id: Option<ProductId>,
    /// Inclusive lower bound on the expiration date.
    pub expires_from: Option<NaiveDate>,
    /// Inclusive upper bound on the expiration date.
    pub expires_until: Option<NaiveDate>,
    pub include_inactive: bool,
}

impl BatchFilter {
    pub fn for_shop(shop_id: ShopId) -> Self {
        Self {
            shop_id,
            product_id: None,
            expires_from: None,
            expires_until: None,
            include_inactive: false,
        }
    }

    pub fn expiring_between(mut self, from: Option<NaiveDate>, until: Option<NaiveDate>) -> Self {
        self.expires_from = from;
        self.expires_until = until;
        self
    }

    pub fn matches(&self, batch: &ProductBatch) -> bool {
        batch.shop_id() == self.shop_id
            && self.product_id.is_none_or(|p| batch.product_id() == p)
            && (self.include_inactive || batch.is_active())
            && self
                .expires_from
                .is_none_or(|from| batch.expiration_date() >= from)
            && self
                .expires_until
                .is_none_or(|until| batch.expiration_date() <= until)
    }
}

/// One row of an inventory count report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReportLine {
    pub product_id: ProductId,
    pub product_code: Option<String>,
    pub product_name: Option<String>,
    pub system_quantity: Quantity,
    pub counted_quantity: Option<Quantity>,
    pub difference: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReport {
    pub inventory_id: InventoryId,
    pub reference: String,
    pub status: InventoryStatus,
    pub lines: Vec<InventoryReportLine>,
    pub total_positive_difference: u64,
    pub total_negative_difference: u64,
}

/// Async read interface over the stock store.
#[async_trait::async_trait]
pub trait StockQuery: Send + Sync {
    async fn product(&self, key: ProductKey) -> Result<Option<Product>, StoreError>;

    /// Every product of the shop, active or not, ordered by code.
    async fn products(&self, shop_id: ShopId) -> Result<Vec<Product>, StoreError>;

    async fn batches(&self, filter: BatchFilter) -> Result<Vec<ProductBatch>, StoreError>;

    async fn movements(
        &self,
        filter: MovementFilter,
        pagination: Pagination,
    ) -> Result<MovementPage, StoreError>;

    /// Signed sum of every movement of the product.
    async fn movement_net(&self, key: ProductKey) -> Result<i64, StoreError>;

    async fn purchase_order(
        &self,
        shop_id: ShopId,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError>;

    async fn inventory(
        &self,
        shop_id: ShopId,
        inventory_id: InventoryId,
    ) -> Result<Option<Inventory>, StoreError>;

    async fn transfer(
        &self,
        pharmacy_id: PharmacyId,
        transfer_id: StockTransferId,
    ) -> Result<Option<StockTransfer>, StoreError>;

    /// Active products at or below `threshold`.
    async fn low_stock_products(
        &self,
        shop_id: ShopId,
        threshold: Quantity,
    ) -> Result<Vec<Product>, StoreError> {
        let products = self.products(shop_id).await?;
        Ok(products
            .into_iter()
            .filter(|p| p.is_active() && p.is_low_stock(threshold))
            .collect())
    }

    /// Product stock, ledger net and batch total side by side.
    async fn ledger_report(&self, key: ProductKey) -> Result<Option<LedgerReport>, StoreError> {
        let Some(product) = self.product(key).await? else {
            return Ok(None);
        };
        let movement_net = self.movement_net(key).await?;
        let batch_total = if product.is_batch_tracked() {
            let filter = BatchFilter {
                product_id: Some(key.product_id),
                ..BatchFilter::for_shop(key.shop_id)
            };
            let batches = self.batches(filter).await?;
            Some(batches.iter().map(|b| b.quantity().value()).sum())
        } else {
            None
        };

        Ok(Some(LedgerReport {
            key,
            product_stock: product.stock().value(),
            movement_net,
            batch_total,
        }))
    }

    /// Item list with differences and totals, enriched with product names.
    async fn inventory_report(
        &self,
        shop_id: ShopId,
        inventory_id: InventoryId,
    ) -> Result<Option<InventoryReport>, StoreError> {
        let Some(inventory) = self.inventory(shop_id, inventory_id).await? else {
            return Ok(None);
        };
        let products = self.products(shop_id).await?;

        let lines = inventory
            .items()
            .iter()
            .map(|item| {
                let product = products.iter().find(|p| p.id_typed() == item.product_id());
                InventoryReportLine {
                    product_id: item.product_id(),
                    product_code: product.map(|p| p.code().to_string()),
                    product_name: product.map(|p| p.name().to_string()),
                    system_quantity: item.system_quantity(),
                    counted_quantity: item.counted_quantity(),
                    difference: item.difference(),
                }
            })
            .collect();

        Ok(Some(InventoryReport {
            inventory_id,
            reference: inventory.reference().to_string(),
            status: inventory.status(),
            lines,
            total_positive_difference: inventory.total_positive_difference(),
            total_negative_difference: inventory.total_negative_difference(),
        }))
    }
}

#[async_trait::async_trait]
impl<S> StockQuery for Arc<S>
where
    S: StockQuery + ?Sized,
{
    async fn product(&self, key: ProductKey) -> Result<Option<Product>, StoreError> {
        (**self).product(key).await
    }

    async fn products(&self, shop_id: ShopId) -> Result<Vec<Product>, StoreError> {
        (**self).products(shop_id).await
    }

    async fn batches(&self, filter: BatchFilter) -> Result<Vec<ProductBatch>, StoreError> {
        (**self).batches(filter).await
    }

    async fn movements(
        &self,
        filter: MovementFilter,
        pagination: Pagination,
    ) -> Result<MovementPage, StoreError> {
        (**self).movements(filter, pagination).await
    }

    async fn movement_net(&self, key: ProductKey) -> Result<i64, StoreError> {
        (**self).movement_net(key).await
    }

    async fn purchase_order(
        &self,
        shop_id: ShopId,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        (**self).purchase_order(shop_id, order_id).await
    }

    async fn inventory(
        &self,
        shop_id: ShopId,
        inventory_id: InventoryId,
    ) -> Result<Option<Inventory>, StoreError> {
        (**self).inventory(shop_id, inventory_id).await
    }

    async fn transfer(
        &self,
        pharmacy_id: PharmacyId,
        transfer_id: StockTransferId,
    ) -> Result<Option<StockTransfer>, StoreError> {
        (**self).transfer(pharmacy_id, transfer_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_defaults_and_caps() {
        assert_eq!(Pagination::default().limit, 50);
        assert_eq!(Pagination::new(Some(5000), None).limit, 1000);
        assert_eq!(Pagination::new(None, Some(7)).offset, 7);
    }

    #[test]
    fn page_reports_more_when_total_exceeds_window() {
        let page = MovementPage::new(vec![], 10, Pagination::new(Some(5), Some(10)));
        assert!(!page.has_more);
        let page = MovementPage::new(vec![], 10, Pagination::new(Some(5), Some(0)));
        assert!(page.has_more);
    }
}
