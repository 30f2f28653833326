//! Transactional persistence boundary for the stock engine.
//!
//! Use-cases open a [`StockTransaction`], lock what they touch, save the
//! results and commit. Dropping or rolling back a transaction discards every
//! write made through it.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryStockStore;
pub use postgres::PostgresStockStore;
pub use query::{
    BatchFilter, InventoryReport, InventoryReportLine, MovementFilter, MovementPage, Pagination,
    StockQuery,
};
pub use r#trait::{StockBackend, StockStore, StockTransaction, StoreError};
