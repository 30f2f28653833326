//! Infrastructure layer: stores, configuration, use-cases and wiring.

pub mod bootstrap;
pub mod config;
pub mod service;
pub mod store;


pub use bootstrap::{SharedBackend, build_service, connect_store};
pub use config::{ConfigError, StockConfig, StockPolicy};
pub use service::{
    BatchExpiry, Reception, Reconciliation, Relocation, ServiceError, ServiceResult,
    StockService,
};
