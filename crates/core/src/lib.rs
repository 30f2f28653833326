//! `stockledger-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the error taxonomy, aggregate traits, the [`Quantity`] value
//! object and the injectable clock/reference providers.

pub mod aggregate;
pub mod clock;
pub mod currency;
pub mod error;
pub mod id;
pub mod quantity;
pub mod reference;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, Entity, ExpectedVersion};
pub use clock::{Clock, FixedClock, SystemClock};
pub use currency::CurrencyCode;
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, PharmacyId, ShopId, UserId};
pub use quantity::Quantity;
pub use reference::{
    INVENTORY_PREFIX, RandomReferenceGenerator, ReferenceGenerator, SequenceReferenceGenerator,
    TRANSFER_PREFIX,
};
pub use value_object::ValueObject;
