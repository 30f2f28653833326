//! Value object trait: equality by value, not identity.
//!
//! Value objects are domain objects that have **no identity** - they are defined entirely
//! by their attribute values. Two value objects with the same values are considered equal.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. To "modify" one,
/// create a new instance: `Quantity::add` returns a fresh `Quantity` rather than
/// mutating the receiver.
///
/// - **Value Object**: `Quantity(5)`, `CurrencyCode("USD")`
/// - **Entity**: `ProductBatch { id: BatchId(...), .. }`
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
