//! Inventory counting domain module.
//!
//! A count session snapshots the shop's stock, collects physical counts and,
//! on validation, tells the use-case which products need an adjustment. Pure
//! domain logic (no IO, no storage).

pub mod session;

pub use session::{
    CancelInventory, CountEntry, CountsRecorded, Inventory, InventoryAdjustment,
    InventoryCancelled, InventoryCommand, InventoryEvent, InventoryId, InventoryItem,
    InventoryItemId, InventoryStarted, InventoryStatus, InventoryValidated, NewInventory,
    RecordCounts, StartInventory, StockSnapshot, ValidateInventory,
};
