//! Application use-cases over the stock store.
//!
//! Every use-case follows the same pipeline:
//!
//! ```text
//! begin transaction
//!   ↓
//! lock the aggregate (order / inventory / transfer), then product rows in
//! ascending ProductKey order
//!   ↓
//! aggregate decides (handle → events, apply → state)
//!   ↓
//! StockPosition applies stock effects and returns the movements
//!   ↓
//! save aggregate + products + batches, append movements
//!   ↓
//! commit (or roll back everything on the first error)
//! ```

mod inventory;
mod purchasing;
mod reports;
mod stock;
mod transfers;

pub use inventory::Reconciliation;
pub use purchasing::Reception;
pub use reports::BatchExpiry;
pub use transfers::Relocation;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use thiserror::Error;
use tracing::{error, warn};

use stockledger_core::{
    AggregateRoot, Clock, DomainError, ExpectedVersion, ReferenceGenerator,
};
use stockledger_stock::{ProductKey, StockMovement, StockPosition};

use crate::config::StockPolicy;
use crate::store::{StockStore, StockTransaction, StoreError};

/// Use-case failure: a rejected business rule or a storage problem.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    /// Stable, machine-readable error code for callers.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Domain(e) => match e {
                DomainError::InvalidStateTransition(_) => "invalid_state_transition",
                DomainError::InsufficientQuantity { .. } => "insufficient_quantity",
                DomainError::ExceedsOrderedQuantity { .. } => "exceeds_ordered_quantity",
                DomainError::InvalidArgument(_) => "invalid_argument",
                DomainError::InvariantViolation(_) => "invariant_violation",
                DomainError::InvalidId(_) => "invalid_id",
                DomainError::NotFound(_) => "not_found",
                DomainError::Conflict(_) => "conflict",
            },
            ServiceError::Store(e) => match e {
                StoreError::Concurrency(_) => "concurrency_conflict",
                StoreError::Duplicate(_) => "duplicate",
                StoreError::Serialization(_) => "storage_corrupt",
                StoreError::Backend(_) => "storage_unavailable",
            },
        }
    }

    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            ServiceError::Domain(e) => Some(e),
            ServiceError::Store(_) => None,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Stock ledger use-cases.
///
/// `S` is any [`StockStore`]; reporting helpers additionally need
/// [`crate::store::StockQuery`]. Time and document references come from the
/// injected providers so tests can pin them.
pub struct StockService<S> {
    store: S,
    clock: Arc<dyn Clock>,
    references: Arc<dyn ReferenceGenerator>,
    policy: StockPolicy,
}

impl<S> StockService<S>
where
    S: StockStore,
{
    pub fn new(
        store: S,
        clock: Arc<dyn Clock>,
        references: Arc<dyn ReferenceGenerator>,
        policy: StockPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            references,
            policy,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> StockPolicy {
        self.policy
    }

    /// Expiry given to batches whose real expiry is unknown.
    fn fallback_expiration(&self, today: NaiveDate) -> ServiceResult<NaiveDate> {
        let days = u64::from(self.policy.adjustment_shelf_life_days);
        today.checked_add_days(Days::new(days)).ok_or_else(|| {
            DomainError::invariant(format!("{today} + {days} days is out of range")).into()
        })
    }
}

/// Commit on success; on failure log, roll back and hand the error back.
async fn finish<T>(
    tx: Box<dyn StockTransaction>,
    operation: &'static str,
    outcome: ServiceResult<T>,
) -> ServiceResult<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            warn!(operation, code = err.code(), error = %err, "use-case rejected, rolling back");
            if let Err(rollback_err) = tx.rollback().await {
                error!(operation, error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

async fn lock_position(
    tx: &mut dyn StockTransaction,
    key: ProductKey,
) -> ServiceResult<StockPosition> {
    let product = tx
        .lock_product(key)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("product {key}")))?;
    let batches = tx.lock_batches(key).await?;
    Ok(StockPosition::new(product, batches)?)
}

/// Lock several products in ascending key order.
async fn lock_positions(
    tx: &mut dyn StockTransaction,
    keys: impl IntoIterator<Item = ProductKey>,
) -> ServiceResult<BTreeMap<ProductKey, StockPosition>> {
    let ordered: BTreeSet<ProductKey> = keys.into_iter().collect();
    let mut positions = BTreeMap::new();
    for key in ordered {
        positions.insert(key, lock_position(tx, key).await?);
    }
    Ok(positions)
}

fn position_mut(
    positions: &mut BTreeMap<ProductKey, StockPosition>,
    key: ProductKey,
) -> ServiceResult<&mut StockPosition> {
    positions
        .get_mut(&key)
        .ok_or_else(|| DomainError::invariant(format!("product {key} was not locked")).into())
}

/// Write back changed products and batches, then append the movements.
async fn persist<'a>(
    tx: &mut dyn StockTransaction,
    positions: impl IntoIterator<Item = &'a StockPosition>,
    movements: &[StockMovement],
) -> ServiceResult<()> {
    for position in positions {
        if position.product().version() == position.loaded_version() {
            continue;
        }
        tx.update_product(
            position.product(),
            ExpectedVersion::Exact(position.loaded_version()),
        )
        .await?;
        for batch in position.changed_batches() {
            tx.save_batch(batch).await?;
        }
    }
    tx.append_movements(movements).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = ServiceError::from(DomainError::insufficient(1, 2));
        assert_eq!(err.code(), "insufficient_quantity");
        let err = ServiceError::from(StoreError::Concurrency("stale".into()));
        assert_eq!(err.code(), "concurrency_conflict");
        assert!(err.as_domain().is_none());
    }
}
