//! Purchasing domain module (purchase orders and their reception).
//!
//! This crate contains business rules for purchase orders, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage). Receiving stock is
//! decided here; moving it is the use-case's job.

pub mod order;

pub use order::{
    AddLine, CancelOrder, ConfirmOrder, LineAdded, LineReceived, NewPurchaseOrder, OrderCancelled,
    OrderConfirmed, OrderPartiallyReceived, OrderReceived, PurchaseOrder, PurchaseOrderCommand,
    PurchaseOrderEvent, PurchaseOrderId, PurchaseOrderLine, PurchaseOrderLineId,
    PurchaseOrderStatus, ReceiveLine, SupplierId, derive_receipt_status,
};
