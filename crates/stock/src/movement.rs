use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, Quantity, ShopId, UserId, typed_id};

use crate::product::{ProductId, ProductKey};

typed_id!(
    /// Ledger entry identifier.
    MovementId
);

/// Kind of stock movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementType {
    In,
    Out,
    Adjustment,
}

impl MovementType {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::In => "in",
            MovementType::Out => "out",
            MovementType::Adjustment => "adjustment",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "in" => Ok(MovementType::In),
            "out" => Ok(MovementType::Out),
            "adjustment" => Ok(MovementType::Adjustment),
            other => Err(DomainError::invalid_argument(format!(
                "unknown movement type '{other}'"
            ))),
        }
    }
}

/// Sign of a movement. IN is always an increase, OUT always a decrease;
/// adjustments carry whichever sign the reconciliation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Increase,
    Decrease,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Increase => "increase",
            Direction::Decrease => "decrease",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "increase" => Ok(Direction::Increase),
            "decrease" => Ok(Direction::Decrease),
            other => Err(DomainError::invalid_argument(format!(
                "unknown movement direction '{other}'"
            ))),
        }
    }
}

/// Who, why and when for a stock change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementContext {
    pub reference: String,
    pub actor: UserId,
    pub at: DateTime<Utc>,
}

impl MovementContext {
    pub fn new(reference: impl Into<String>, actor: UserId, at: DateTime<Utc>) -> Self {
        Self {
            reference: reference.into(),
            actor,
            at,
        }
    }
}

/// Immutable ledger entry: one quantity change for one product in one shop.
///
/// There are no setters. A movement is created exactly once by the stock
/// mutation that produced it and is never updated or deleted afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    id: MovementId,
    shop_id: ShopId,
    product_id: ProductId,
    movement_type: MovementType,
    direction: Direction,
    quantity: Quantity,
    reference: String,
    created_by: UserId,
    created_at: DateTime<Utc>,
}

impl StockMovement {
    /// Stock entering the shop (reception, transfer in, manual entry).
    pub fn in_(key: ProductKey, quantity: Quantity, ctx: &MovementContext) -> DomainResult<Self> {
        Self::build(key, MovementType::In, Direction::Increase, quantity, ctx)
    }

    /// Stock leaving the shop (sale, transfer out, write-off).
    pub fn out(key: ProductKey, quantity: Quantity, ctx: &MovementContext) -> DomainResult<Self> {
        Self::build(key, MovementType::Out, Direction::Decrease, quantity, ctx)
    }

    /// Reconciliation to a physical count; the sign of `delta` is stored.
    pub fn adjustment(key: ProductKey, delta: i64, ctx: &MovementContext) -> DomainResult<Self> {
        let direction = if delta >= 0 {
            Direction::Increase
        } else {
            Direction::Decrease
        };
        Self::build(
            key,
            MovementType::Adjustment,
            direction,
            Quantity::from_signed_abs(delta),
            ctx,
        )
    }

    fn build(
        key: ProductKey,
        movement_type: MovementType,
        direction: Direction,
        quantity: Quantity,
        ctx: &MovementContext,
    ) -> DomainResult<Self> {
        if quantity.is_zero() {
            return Err(DomainError::invalid_argument(
                "movement quantity must be positive",
            ));
        }
        if ctx.reference.trim().is_empty() {
            return Err(DomainError::invalid_argument(
                "movement reference cannot be empty",
            ));
        }
        Ok(Self {
            id: MovementId::generate(),
            shop_id: key.shop_id,
            product_id: key.product_id,
            movement_type,
            direction,
            quantity,
            reference: ctx.reference.clone(),
            created_by: ctx.actor,
            created_at: ctx.at,
        })
    }

    /// Rehydrate a movement read back from storage.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: MovementId,
        shop_id: ShopId,
        product_id: ProductId,
        movement_type: MovementType,
        direction: Direction,
        quantity: Quantity,
        reference: String,
        created_by: UserId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            shop_id,
            product_id,
            movement_type,
            direction,
            quantity,
            reference,
            created_by,
            created_at,
        }
    }

    pub fn id(&self) -> MovementId {
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

    pub fn movement_type(&self) -> MovementType {
        self.movement_type
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn created_by(&self) -> UserId {
        self.created_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Quantity with the stored sign applied.
    pub fn signed_quantity(&self) -> i64 {
        match self.direction {
            Direction::Increase => self.quantity.as_signed(),
            Direction::Decrease => -self.quantity.as_signed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ctx() -> MovementContext {
        MovementContext::new("PO-1", UserId::new(), Utc::now())
    }

    fn key() -> ProductKey {
        ProductKey::new(ShopId::new(), ProductId::generate())
    }

    #[test]
    fn adjustment_stores_sign() {
        let up = StockMovement::adjustment(key(), 4, &ctx()).unwrap();
        let down = StockMovement::adjustment(key(), -5, &ctx()).unwrap();
        assert_eq!(up.signed_quantity(), 4);
        assert_eq!(down.quantity().value(), 5);
        assert_eq!(down.direction(), Direction::Decrease);
        assert_eq!(down.signed_quantity(), -5);
    }

    #[test]
    fn zero_quantity_and_blank_reference_are_rejected() {
        assert!(StockMovement::in_(key(), Quantity::ZERO, &ctx()).is_err());
        assert!(StockMovement::adjustment(key(), 0, &ctx()).is_err());
        let blank = MovementContext::new("  ", UserId::new(), Utc::now());
        assert!(StockMovement::out(key(), Quantity::new(1), &blank).is_err());
    }

    #[test]
    fn type_names_round_trip() {
        for t in [MovementType::In, MovementType::Out, MovementType::Adjustment] {
            assert_eq!(MovementType::parse(t.as_str()).unwrap(), t);
        }
        assert!(Direction::parse("sideways").is_err());
    }
}
