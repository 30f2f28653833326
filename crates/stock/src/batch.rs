//! Product batches (lots) with an expiration date, consumed FEFO.
//!
//! Batch quantities only change through [`StockPosition`](crate::StockPosition),
//! which records a movement for every change and keeps the product stock equal
//! to the active batch total. The mutators are crate-private:
//!
//! ```compile_fail
//! use chrono::Utc;
//! use stockledger_core::Quantity;
//! use stockledger_stock::ProductBatch;
//!
//! fn drain(batch: &mut ProductBatch) {
//!     batch.decrease_quantity(Quantity::new(1), Utc::now()).unwrap();
//! }
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{
    AggregateId, DomainError, DomainResult, Entity, Quantity, ShopId, typed_id,
};

use crate::product::{ProductId, ProductKey};

typed_id!(
    /// Product batch (lot) identifier.
    BatchId
);

/// Three-way expiry classification, plus `Critical` when a critical window is
/// configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationStatus {
    Expired,
    Critical,
    ExpiringSoon,
    Ok,
}

/// Reporting thresholds in days. `critical_days` should not exceed
/// `warning_days`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryThresholds {
    pub critical_days: u32,
    pub warning_days: u32,
}

impl ExpiryThresholds {
    pub fn new(critical_days: u32, warning_days: u32) -> DomainResult<Self> {
        if critical_days > warning_days {
            return Err(DomainError::invalid_argument(
                "critical window cannot be wider than the warning window",
            ));
        }
        Ok(Self {
            critical_days,
            warning_days,
        })
    }
}

/// Lot identity supplied when stock enters a batch-tracked product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub batch_number: String,
    pub expiration_date: NaiveDate,
    pub purchase_order_id: Option<AggregateId>,
    pub purchase_order_line_id: Option<AggregateId>,
}

impl Lot {
    pub fn new(batch_number: impl Into<String>, expiration_date: NaiveDate) -> Self {
        Self {
            batch_number: batch_number.into(),
            expiration_date,
            purchase_order_id: None,
            purchase_order_line_id: None,
        }
    }

    pub fn with_purchase_origin(mut self, order_id: AggregateId, line_id: AggregateId) -> Self {
        self.purchase_order_id = Some(order_id);
        self.purchase_order_line_id = Some(line_id);
        self
    }
}

/// A lot of one product in one shop with its own expiry and quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductBatch {
    id: BatchId,
    shop_id: ShopId,
    product_id: ProductId,
    batch_number: String,
    quantity: Quantity,
    expiration_date: NaiveDate,
    purchase_order_id: Option<AggregateId>,
    purchase_order_line_id: Option<AggregateId>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProductBatch {
    pub(crate) fn create(
        key: ProductKey,
        lot: Lot,
        quantity: Quantity,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let batch_number = lot.batch_number.trim().to_string();
        if batch_number.is_empty() {
            return Err(DomainError::invalid_argument("batch number cannot be empty"));
        }
        Ok(Self {
            id: BatchId::generate(),
            shop_id: key.shop_id,
            product_id: key.product_id,
            batch_number,
            quantity,
            expiration_date: lot.expiration_date,
            purchase_order_id: lot.purchase_order_id,
            purchase_order_line_id: lot.purchase_order_line_id,
            is_active: true,
            created_at: at,
            updated_at: at,
        })
    }

    pub fn id_typed(&self) -> BatchId {
        self.id
    }

    pub fn shop_id(&self) -> ShopId {
        self.shop_id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn key(&self) -> ProductKey {
        ProductKey::new(self.shop_id, self.product_id)
    }

    pub fn batch_number(&self) -> &str {
        &self.batch_number
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    pub fn expiration_date(&self) -> NaiveDate {
        self.expiration_date
    }

    pub fn purchase_order_id(&self) -> Option<AggregateId> {
        self.purchase_order_id
    }

    pub fn purchase_order_line_id(&self) -> Option<AggregateId> {
        self.purchase_order_line_id
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Earliest-expiry-first ordering key.
    pub fn fefo_key(&self) -> (NaiveDate, DateTime<Utc>, BatchId) {
        (self.expiration_date, self.created_at, self.id)
    }

    pub(crate) fn increase_quantity(
        &mut self,
        amount: Quantity,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        if amount.is_zero() {
            return Err(DomainError::invalid_argument(
                "batch increase must be positive",
            ));
        }
        self.quantity = self.quantity.add(amount)?;
        self.is_active = true;
        self.updated_at = at;
        Ok(())
    }

    pub(crate) fn decrease_quantity(
        &mut self,
        amount: Quantity,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        if amount.is_zero() {
            return Err(DomainError::invalid_argument(
                "batch decrease must be positive",
            ));
        }
        self.quantity = self.quantity.subtract(amount)?;
        self.updated_at = at;
        Ok(())
    }

    /// Soft-deactivate a batch (fully consumed, kept for reporting history).
    pub(crate) fn deactivate(&mut self, at: DateTime<Utc>) {
        self.is_active = false;
        self.updated_at = at;
    }

    pub fn days_until_expiration(&self, as_of: NaiveDate) -> i64 {
        (self.expiration_date - as_of).num_days()
    }

    pub fn is_expired(&self, as_of: NaiveDate) -> bool {
        self.days_until_expiration(as_of) < 0
    }

    /// Not yet expired and expiring within `days` (inclusive).
    pub fn expires_within_days(&self, days: u32, as_of: NaiveDate) -> bool {
        let remaining = self.days_until_expiration(as_of);
        (0..=i64::from(days)).contains(&remaining)
    }

    pub fn expiration_status(&self, warning_days: u32, as_of: NaiveDate) -> ExpirationStatus {
        let remaining = self.days_until_expiration(as_of);
        if remaining < 0 {
            ExpirationStatus::Expired
        } else if remaining <= i64::from(warning_days) {
            ExpirationStatus::ExpiringSoon
        } else {
            ExpirationStatus::Ok
        }
    }

    pub fn expiration_status_with(
        &self,
        thresholds: ExpiryThresholds,
        as_of: NaiveDate,
    ) -> ExpirationStatus {
        let remaining = self.days_until_expiration(as_of);
        if remaining < 0 {
            ExpirationStatus::Expired
        } else if remaining <= i64::from(thresholds.critical_days) {
            ExpirationStatus::Critical
        } else if remaining <= i64::from(thresholds.warning_days) {
            ExpirationStatus::ExpiringSoon
        } else {
            ExpirationStatus::Ok
        }
    }
}

impl Entity for ProductBatch {
    type Id = BatchId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
