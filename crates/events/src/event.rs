use chrono::{DateTime, Utc};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "purchasing.order.line_received").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Whether applying this event requires the use-case to move stock.
    fn stock_effect(&self) -> StockEffect {
        StockEffect::None
    }
}

/// Classification of an event's impact on the stock ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockEffect {
    /// Status or bookkeeping change only.
    None,
    /// Stock enters the shop.
    Inbound,
    /// Stock is reconciled to a physical count.
    Reconciliation,
    /// Stock moves between shops.
    Relocation,
}
