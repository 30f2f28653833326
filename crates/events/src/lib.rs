//! Domain events emitted by the stock workflows.
//!
//! Events are the facts an aggregate's `handle` decides on. The use-case layer
//! applies them to the aggregate and translates the stock-relevant ones into
//! ledger movements.

pub mod event;

pub use event::{Event, StockEffect};
