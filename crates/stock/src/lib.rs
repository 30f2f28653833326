//! Stock domain module: products' stock rows, batches and the movement ledger.
//!
//! Pure, deterministic domain logic (no IO, no storage). [`StockPosition`] is
//! the single entry point for changing a quantity.

pub mod batch;
pub mod ledger;
pub mod movement;
pub mod position;
pub mod product;

pub use batch::{BatchId, ExpirationStatus, ExpiryThresholds, Lot, ProductBatch};
pub use ledger::{LedgerReport, net_quantity};
pub use movement::{Direction, MovementContext, MovementId, MovementType, StockMovement};
pub use position::{ADJUSTMENT_BATCH_PREFIX, ConsumedLot, Removal, StockPosition};
pub use product::{CategoryId, NewProduct, Product, ProductId, ProductKey};
