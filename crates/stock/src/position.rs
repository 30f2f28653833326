//! The stock mutation service.
//!
//! A [`StockPosition`] is a product row together with all of its batches, as
//! loaded (and locked) by the use-case. It is the only place that calls
//! `Product::add_stock` / `remove_stock` and mutates batch quantities, and every
//! successful operation returns the [`StockMovement`] describing it. Operations
//! run against a scratch copy and only replace `self` on success, so a failed
//! operation leaves the position untouched.
//!
//! Batch policy for batch-tracked products is earliest expiry first (FEFO),
//! ordered by `(expiration_date, created_at, id)`:
//! - decreases drain the earliest-expiring active batch, then the next;
//! - positive adjustments land on the earliest-expiring active batch, or on a
//!   fresh batch named `ADJ-<reference>` when none is active.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use stockledger_core::{AggregateRoot, DomainError, DomainResult, Quantity};

use crate::batch::{BatchId, Lot, ProductBatch};
use crate::movement::{MovementContext, StockMovement};
use crate::product::{Product, ProductKey};

/// Prefix of batches created to absorb a positive count adjustment.
pub const ADJUSTMENT_BATCH_PREFIX: &str = "ADJ";

/// Quantity taken from one lot by a decrease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedLot {
    pub batch_id: BatchId,
    pub batch_number: String,
    pub expiration_date: NaiveDate,
    pub quantity: Quantity,
}

/// Outcome of a decrease: the ledger entry plus the lots it drew from (empty
/// for products without batch tracking).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub movement: StockMovement,
    pub consumed: Vec<ConsumedLot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockPosition {
    product: Product,
    batches: Vec<ProductBatch>,
    loaded_version: u64,
    touched: BTreeSet<BatchId>,
}

impl StockPosition {
    /// Wrap a loaded product and its batches.
    ///
    /// Rejects batches of another product and, for batch-tracked products, a
    /// product stock that differs from the sum of active batch quantities.
    pub fn new(product: Product, mut batches: Vec<ProductBatch>) -> DomainResult<Self> {
        let key = product.key();
        if let Some(stray) = batches.iter().find(|b| b.key() != key) {
            return Err(DomainError::invariant(format!(
                "batch {} belongs to {}, not {key}",
                stray.id_typed(),
                stray.key()
            )));
        }
        batches.sort_by_key(|b| b.fefo_key());

        let position = Self {
            loaded_version: product.version(),
            product,
            batches,
            touched: BTreeSet::new(),
        };
        position.check_consistency()?;
        Ok(position)
    }

    pub fn key(&self) -> ProductKey {
        self.product.key()
    }

    pub fn product(&self) -> &Product {
        &self.product
    }

    /// All batches, FEFO order.
    pub fn batches(&self) -> &[ProductBatch] {
        &self.batches
    }

    pub fn active_batches(&self) -> impl Iterator<Item = &ProductBatch> {
        self.batches.iter().filter(|b| b.is_active())
    }

    /// Product version as loaded, for the optimistic check on save.
    pub fn loaded_version(&self) -> u64 {
        self.loaded_version
    }

    /// Batches created or modified since the position was loaded.
    pub fn changed_batches(&self) -> impl Iterator<Item = &ProductBatch> {
        self.batches
            .iter()
            .filter(|b| self.touched.contains(&b.id_typed()))
    }

    pub fn batch_total(&self) -> Quantity {
        Quantity::new(self.active_batches().map(|b| b.quantity().value()).sum())
    }

    /// Product stock must equal the active batch total for tracked products.
    pub fn check_consistency(&self) -> DomainResult<()> {
        if !self.product.is_batch_tracked() {
            return Ok(());
        }
        let total = self.batch_total();
        if total != self.product.stock() {
            return Err(DomainError::invariant(format!(
                "stock of {} is {} but its active batches hold {}",
                self.key(),
                self.product.stock(),
                total
            )));
        }
        Ok(())
    }

    /// Stock enters the shop: reception, manual entry.
    ///
    /// Batch-tracked products require a lot; an existing batch with the same
    /// number is topped up (its expiry must match), otherwise a batch is created.
    pub fn receive(
        &mut self,
        ctx: &MovementContext,
        quantity: Quantity,
        lot: Option<Lot>,
    ) -> DomainResult<StockMovement> {
        let quantity = require_positive(quantity)?;
        let mut next = self.clone();

        if next.product.is_batch_tracked() {
            let lot = lot.ok_or_else(|| {
                DomainError::invalid_argument(
                    "batch number and expiration date are required for batch-tracked products",
                )
            })?;
            next.put_into_lot(lot, quantity, ctx)?;
        }
        next.product.add_stock(quantity, ctx.at)?;
        let movement = StockMovement::in_(next.key(), quantity, ctx)?;

        next.check_consistency()?;
        *self = next;
        Ok(movement)
    }

    /// Stock arrives from another shop. Each consumed source lot is recreated
    /// here with its batch number and expiry; when the source had no lots, a
    /// single batch named after the reference is opened with
    /// `fallback_expiration`.
    pub fn receive_transfer(
        &mut self,
        ctx: &MovementContext,
        quantity: Quantity,
        lots: &[ConsumedLot],
        fallback_expiration: NaiveDate,
    ) -> DomainResult<StockMovement> {
        let quantity = require_positive(quantity)?;
        let mut next = self.clone();

        if next.product.is_batch_tracked() {
            if lots.is_empty() {
                next.put_into_lot(
                    Lot::new(ctx.reference.clone(), fallback_expiration),
                    quantity,
                    ctx,
                )?;
            } else {
                let carried: u64 = lots.iter().map(|l| l.quantity.value()).sum();
                if carried != quantity.value() {
                    return Err(DomainError::invariant(format!(
                        "transferred lots hold {carried}, expected {quantity}"
                    )));
                }
                for lot in lots {
                    next.put_into_lot(
                        Lot::new(lot.batch_number.clone(), lot.expiration_date),
                        lot.quantity,
                        ctx,
                    )?;
                }
            }
        }
        next.product.add_stock(quantity, ctx.at)?;
        let movement = StockMovement::in_(next.key(), quantity, ctx)?;

        next.check_consistency()?;
        *self = next;
        Ok(movement)
    }

    /// Stock leaves the shop: sale, transfer out, write-off.
    pub fn remove(&mut self, ctx: &MovementContext, quantity: Quantity) -> DomainResult<Removal> {
        let quantity = require_positive(quantity)?;
        let mut next = self.clone();

        let consumed = next.take(quantity, ctx)?;
        let movement = StockMovement::out(next.key(), quantity, ctx)?;

        next.check_consistency()?;
        *self = next;
        Ok(Removal { movement, consumed })
    }

    /// Reconcile to a physical count. `delta` is counted minus system
    /// quantity; zero produces no movement.
    pub fn adjust(
        &mut self,
        ctx: &MovementContext,
        delta: i64,
        fallback_expiration: NaiveDate,
    ) -> DomainResult<Option<StockMovement>> {
        if delta == 0 {
            return Ok(None);
        }
        let magnitude = Quantity::from_signed_abs(delta);
        let mut next = self.clone();

        if delta < 0 {
            next.take(magnitude, ctx)?;
        } else {
            if next.product.is_batch_tracked() {
                let target = next.batches.iter().position(|b| b.is_active());
                match target {
                    Some(idx) => {
                        next.batches[idx].increase_quantity(magnitude, ctx.at)?;
                        let id = next.batches[idx].id_typed();
                        next.touched.insert(id);
                    }
                    None => {
                        let number = format!("{ADJUSTMENT_BATCH_PREFIX}-{}", ctx.reference);
                        next.put_into_lot(Lot::new(number, fallback_expiration), magnitude, ctx)?;
                    }
                }
            }
            next.product.add_stock(magnitude, ctx.at)?;
        }
        let movement = StockMovement::adjustment(next.key(), delta, ctx)?;

        next.check_consistency()?;
        *self = next;
        Ok(Some(movement))
    }

    pub fn into_parts(self) -> (Product, Vec<ProductBatch>) {
        (self.product, self.batches)
    }

    fn put_into_lot(
        &mut self,
        lot: Lot,
        quantity: Quantity,
        ctx: &MovementContext,
    ) -> DomainResult<()> {
        let number = lot.batch_number.trim().to_string();
        if let Some(batch) = self
            .batches
            .iter_mut()
            .find(|b| b.batch_number() == number)
        {
            if batch.expiration_date() != lot.expiration_date {
                return Err(DomainError::invalid_argument(format!(
                    "batch {number} is registered with expiry {}, got {}",
                    batch.expiration_date(),
                    lot.expiration_date
                )));
            }
            batch.increase_quantity(quantity, ctx.at)?;
            self.touched.insert(batch.id_typed());
        } else {
            let batch = ProductBatch::create(self.product.key(), lot, quantity, ctx.at)?;
            self.touched.insert(batch.id_typed());
            self.batches.push(batch);
            self.batches.sort_by_key(|b| b.fefo_key());
        }
        Ok(())
    }

    /// Decrease product stock (and batches, FEFO) by `quantity`.
    fn take(&mut self, quantity: Quantity, ctx: &MovementContext) -> DomainResult<Vec<ConsumedLot>> {
        let available = self.product.stock();
        if available < quantity {
            return Err(DomainError::insufficient(available.value(), quantity.value()));
        }

        let mut consumed = Vec::new();
        if self.product.is_batch_tracked() {
            let mut remaining = quantity;
            for batch in self.batches.iter_mut().filter(|b| b.is_active()) {
                if remaining.is_zero() {
                    break;
                }
                let take = remaining.min(batch.quantity());
                if take.is_zero() {
                    continue;
                }
                batch.decrease_quantity(take, ctx.at)?;
                if batch.quantity().is_zero() {
                    batch.deactivate(ctx.at);
                }
                remaining = remaining.subtract(take)?;
                self.touched.insert(batch.id_typed());
                consumed.push(ConsumedLot {
                    batch_id: batch.id_typed(),
                    batch_number: batch.batch_number().to_string(),
                    expiration_date: batch.expiration_date(),
                    quantity: take,
                });
            }
            if !remaining.is_zero() {
                return Err(DomainError::insufficient(
                    quantity.value() - remaining.value(),
                    quantity.value(),
                ));
            }
        }

        self.product.remove_stock(quantity, ctx.at)?;
        Ok(consumed)
    }
}

fn require_positive(quantity: Quantity) -> DomainResult<Quantity> {
    if quantity.is_zero() {
        return Err(DomainError::invalid_argument("quantity must be positive"));
    }
    Ok(quantity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use stockledger_core::{ShopId, UserId};

    use crate::movement::{Direction, MovementType};
    use crate::product::{NewProduct, ProductId};

    fn ctx(reference: &str) -> MovementContext {
        MovementContext::new(
            reference,
            UserId::new(),
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        )
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    fn position(batch_tracked: bool) -> StockPosition {
        let product = Product::create(
            NewProduct {
                shop_id: ShopId::new(),
                product_id: ProductId::generate(),
                code: "AMOX-250".to_string(),
                name: "Amoxicillin 250mg".to_string(),
                price: dec!(4.10),
                category_id: None,
                batch_tracked,
            },
            Utc::now(),
        )
        .unwrap();
        StockPosition::new(product, vec![]).unwrap()
    }

    #[test]
    fn tracked_receive_requires_a_lot() {
        let mut pos = position(true);
        let err = pos.receive(&ctx("PO-1"), Quantity::new(5), None).unwrap_err();
        assert!(matches!(err, DomainError::InvalidArgument(_)));
        assert!(pos.product().stock().is_zero());
    }

    #[test]
    fn receive_tops_up_matching_batch() {
        let mut pos = position(true);
        pos.receive(&ctx("PO-1"), Quantity::new(5), Some(Lot::new("L1", day(10))))
            .unwrap();
        let movement = pos
            .receive(&ctx("PO-1"), Quantity::new(3), Some(Lot::new("L1", day(10))))
            .unwrap();
        assert_eq!(movement.movement_type(), MovementType::In);
        assert_eq!(pos.batches().len(), 1);
        assert_eq!(pos.batches()[0].quantity().value(), 8);
        assert_eq!(pos.product().stock().value(), 8);

        let err = pos
            .receive(&ctx("PO-1"), Quantity::new(1), Some(Lot::new("L1", day(11))))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidArgument(_)));
        assert_eq!(pos.product().stock().value(), 8);
    }

    #[test]
    fn remove_consumes_earliest_expiry_first() {
        let mut pos = position(true);
        pos.receive(&ctx("PO-1"), Quantity::new(5), Some(Lot::new("LATE", day(20))))
            .unwrap();
        pos.receive(&ctx("PO-2"), Quantity::new(4), Some(Lot::new("EARLY", day(5))))
            .unwrap();

        let removal = pos.remove(&ctx("SALE-1"), Quantity::new(6)).unwrap();
        assert_eq!(removal.movement.direction(), Direction::Decrease);
        assert_eq!(removal.consumed.len(), 2);
        assert_eq!(removal.consumed[0].batch_number, "EARLY");
        assert_eq!(removal.consumed[0].quantity.value(), 4);
        assert_eq!(removal.consumed[1].batch_number, "LATE");
        assert_eq!(removal.consumed[1].quantity.value(), 2);

        let early = pos.batches().iter().find(|b| b.batch_number() == "EARLY").unwrap();
        assert!(!early.is_active());
        assert_eq!(pos.product().stock().value(), 3);
        assert_eq!(pos.batch_total().value(), 3);
    }

    #[test]
    fn insufficient_remove_leaves_position_untouched() {
        let mut pos = position(true);
        pos.receive(&ctx("PO-1"), Quantity::new(4), Some(Lot::new("L1", day(5))))
            .unwrap();
        let before = pos.clone();
        let err = pos.remove(&ctx("TRF-1"), Quantity::new(10)).unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientQuantity {
                available: 4,
                requested: 10
            }
        );
        assert_eq!(pos, before);
    }

    #[test]
    fn negative_adjustment_follows_fefo() {
        let mut pos = position(true);
        pos.receive(&ctx("PO-1"), Quantity::new(30), Some(Lot::new("B", day(20))))
            .unwrap();
        pos.receive(&ctx("PO-1"), Quantity::new(20), Some(Lot::new("A", day(3))))
            .unwrap();

        let movement = pos.adjust(&ctx("INV-1"), -25, day(30)).unwrap().unwrap();
        assert_eq!(movement.movement_type(), MovementType::Adjustment);
        assert_eq!(movement.signed_quantity(), -25);
        let a = pos.batches().iter().find(|b| b.batch_number() == "A").unwrap();
        let b = pos.batches().iter().find(|b| b.batch_number() == "B").unwrap();
        assert_eq!(a.quantity().value(), 0);
        assert_eq!(b.quantity().value(), 25);
        assert_eq!(pos.product().stock().value(), 25);
    }

    #[test]
    fn positive_adjustment_without_batches_opens_adjustment_batch() {
        let mut pos = position(true);
        let movement = pos.adjust(&ctx("INV-20240601-ABCDEF"), 7, day(31)).unwrap().unwrap();
        assert_eq!(movement.signed_quantity(), 7);
        assert_eq!(pos.batches().len(), 1);
        assert_eq!(pos.batches()[0].batch_number(), "ADJ-INV-20240601-ABCDEF");
        assert_eq!(pos.batches()[0].expiration_date(), day(31));
        assert_eq!(pos.changed_batches().count(), 1);
    }

    #[test]
    fn zero_adjustment_is_a_no_op() {
        let mut pos = position(false);
        assert!(pos.adjust(&ctx("INV-1"), 0, day(1)).unwrap().is_none());
        assert_eq!(pos.product().version(), 0);
    }

    #[test]
    fn transfer_reception_recreates_lots() {
        let mut source = position(true);
        source
            .receive(&ctx("PO-1"), Quantity::new(5), Some(Lot::new("A", day(3))))
            .unwrap();
        source
            .receive(&ctx("PO-1"), Quantity::new(5), Some(Lot::new("B", day(9))))
            .unwrap();
        let removal = source.remove(&ctx("TRF-1"), Quantity::new(7)).unwrap();

        let mut destination = position(true);
        destination
            .receive_transfer(&ctx("TRF-1"), Quantity::new(7), &removal.consumed, day(30))
            .unwrap();
        let numbers: Vec<_> = destination
            .batches()
            .iter()
            .map(|b| (b.batch_number().to_string(), b.quantity().value()))
            .collect();
        assert_eq!(numbers, vec![("A".to_string(), 5), ("B".to_string(), 2)]);
    }

    #[test]
    fn inconsistent_position_is_rejected() {
        let mut pos = position(true);
        pos.receive(&ctx("PO-1"), Quantity::new(5), Some(Lot::new("A", day(3))))
            .unwrap();
        let (product, _batches) = pos.into_parts();
        assert!(matches!(
            StockPosition::new(product, vec![]),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn batch_drained_outside_position_is_rejected_on_reload() {
        let mut pos = position(true);
        pos.receive(&ctx("PO-1"), Quantity::new(10), Some(Lot::new("A", day(3))))
            .unwrap();
        let (product, mut batches) = pos.into_parts();

        batches[0]
            .decrease_quantity(Quantity::new(7), Utc::now())
            .unwrap();

        assert!(matches!(
            StockPosition::new(product, batches),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn batch_changes_through_position_keep_stock_and_batches_aligned() {
        let mut pos = position(true);
        pos.receive(&ctx("PO-1"), Quantity::new(10), Some(Lot::new("A", day(3))))
            .unwrap();
        let (product, batches) = pos.into_parts();
        let mut pos = StockPosition::new(product, batches).unwrap();

        pos.remove(&ctx("SALE-1"), Quantity::new(7)).unwrap();

        let changed: Vec<_> = pos.changed_batches().map(|b| b.quantity()).collect();
        assert_eq!(changed, vec![Quantity::new(3)]);
        assert_eq!(pos.product().stock(), Quantity::new(3));
        assert_eq!(pos.batch_total(), Quantity::new(3));
        pos.check_consistency().unwrap();
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Receive(u64, u32),
            Remove(u64),
            Adjust(i64),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (1u64..50, 1u32..28).prop_map(|(q, d)| Op::Receive(q, d)),
                (1u64..60).prop_map(Op::Remove),
                (-40i64..40).prop_map(Op::Adjust),
            ]
        }

        proptest! {
            /// Property: the signed sum of emitted movements always equals the
            /// product stock, and batches always sum to the stock.
            #[test]
            fn ledger_identity_holds(ops in proptest::collection::vec(op(), 1..40)) {
                let mut pos = position(true);
                let mut net: i64 = 0;
                for op in ops {
                    let result = match op {
                        Op::Receive(q, d) => pos
                            .receive(&ctx("PO"), Quantity::new(q), Some(Lot::new(format!("L{d}"), day(d))))
                            .map(|m| vec![m]),
                        Op::Remove(q) => pos.remove(&ctx("SALE"), Quantity::new(q)).map(|r| vec![r.movement]),
                        Op::Adjust(delta) => pos
                            .adjust(&ctx("INV"), delta, day(28) + Duration::days(30))
                            .map(|m| m.into_iter().collect()),
                    };
                    if let Ok(movements) = result {
                        net += movements.iter().map(|m| m.signed_quantity()).sum::<i64>();
                    }
                    prop_assert_eq!(net, pos.product().stock().as_signed());
                    prop_assert!(pos.check_consistency().is_ok());
                }
            }
        }
    }
}
