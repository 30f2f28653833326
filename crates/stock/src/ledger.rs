//! Ledger identity checks.

use serde::{Deserialize, Serialize};

use crate::movement::StockMovement;
use crate::product::ProductKey;

/// Net signed quantity of a set of movements.
pub fn net_quantity<'a>(movements: impl IntoIterator<Item = &'a StockMovement>) -> i64 {
    movements.into_iter().map(StockMovement::signed_quantity).sum()
}

/// Side-by-side view of the three quantities that must agree for a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReport {
    pub key: ProductKey,
    pub product_stock: u64,
    pub movement_net: i64,
    /// Sum of active batch quantities; `None` when the product is not
    /// batch-tracked.
    pub batch_total: Option<u64>,
}

impl LedgerReport {
    pub fn is_consistent(&self) -> bool {
        let stock = i64::try_from(self.product_stock).unwrap_or(i64::MAX);
        stock == self.movement_net && self.batch_total.is_none_or(|t| t == self.product_stock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stockledger_core::{Quantity, ShopId, UserId};

    use crate::movement::MovementContext;
    use crate::product::ProductId;

    #[test]
    fn net_quantity_applies_signs() {
        let key = ProductKey::new(ShopId::new(), ProductId::generate());
        let ctx = MovementContext::new("REF", UserId::new(), Utc::now());
        let movements = vec![
            StockMovement::in_(key, Quantity::new(60), &ctx).unwrap(),
            StockMovement::in_(key, Quantity::new(40), &ctx).unwrap(),
            StockMovement::out(key, Quantity::new(15), &ctx).unwrap(),
            StockMovement::adjustment(key, -5, &ctx).unwrap(),
        ];
        assert_eq!(net_quantity(&movements), 80);

        let report = LedgerReport {
            key,
            product_stock: 80,
            movement_net: 80,
            batch_total: Some(80),
        };
        assert!(report.is_consistent());
        assert!(!LedgerReport { batch_total: Some(79), ..report }.is_consistent());
    }
}
