//! Configuration loading and representation.
//!
//! Everything comes from environment variables; unset variables fall back to
//! the defaults below, malformed ones are a [`ConfigError`].

use std::collections::HashMap;

use thiserror::Error;

use stockledger_core::Quantity;
use stockledger_observability::LogFormat;
use stockledger_stock::ExpiryThresholds;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_EXPIRY_WARNING_DAYS: u32 = 30;
pub const DEFAULT_EXPIRY_CRITICAL_DAYS: u32 = 7;
pub const DEFAULT_ADJUSTMENT_SHELF_LIFE_DAYS: u32 = 365;
pub const DEFAULT_LOW_STOCK_THRESHOLD: u64 = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name}: expected {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Business knobs the use-cases read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockPolicy {
    pub expiry: ExpiryThresholds,
    /// Shelf life given to batches created without a known expiry (positive
    /// count adjustments, transfers from untracked stock).
    pub adjustment_shelf_life_days: u32,
    pub low_stock_threshold: Quantity,
}

impl Default for StockPolicy {
    fn default() -> Self {
        Self {
            expiry: ExpiryThresholds {
                critical_days: DEFAULT_EXPIRY_CRITICAL_DAYS,
                warning_days: DEFAULT_EXPIRY_WARNING_DAYS,
            },
            adjustment_shelf_life_days: DEFAULT_ADJUSTMENT_SHELF_LIFE_DAYS,
            low_stock_threshold: Quantity::new(DEFAULT_LOW_STOCK_THRESHOLD),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockConfig {
    /// Postgres when set, in-memory store otherwise.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub policy: StockPolicy,
    pub log_format: LogFormat,
}

impl Default for StockConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            policy: StockPolicy::default(),
            log_format: LogFormat::Json,
        }
    }
}

impl StockConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build from an explicit variable map (same names as the environment).
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

        let warning_days = parse_or(
            "STOCK_EXPIRY_WARNING_DAYS",
            get("STOCK_EXPIRY_WARNING_DAYS"),
            DEFAULT_EXPIRY_WARNING_DAYS,
        )?;
        let critical_days = parse_or(
            "STOCK_EXPIRY_CRITICAL_DAYS",
            get("STOCK_EXPIRY_CRITICAL_DAYS"),
            DEFAULT_EXPIRY_CRITICAL_DAYS,
        )?;
        let expiry = ExpiryThresholds::new(critical_days, warning_days)
            .map_err(|e| ConfigError::Inconsistent(e.to_string()))?;

        let max_connections = parse_or(
            "STOCK_DB_MAX_CONNECTIONS",
            get("STOCK_DB_MAX_CONNECTIONS"),
            DEFAULT_MAX_CONNECTIONS,
        )?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                name: "STOCK_DB_MAX_CONNECTIONS",
                expected: "a positive integer",
                value: "0".to_string(),
            });
        }

        let log_format = match get("STOCK_LOG_FORMAT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "STOCK_LOG_FORMAT",
                expected: "'json' or 'text'",
                value: raw.to_string(),
            })?,
            None => LogFormat::Json,
        };

        Ok(Self {
            database_url: get("DATABASE_URL").map(str::to_string),
            max_connections,
            policy: StockPolicy {
                expiry,
                adjustment_shelf_life_days: parse_or(
                    "STOCK_ADJUSTMENT_SHELF_LIFE_DAYS",
                    get("STOCK_ADJUSTMENT_SHELF_LIFE_DAYS"),
                    DEFAULT_ADJUSTMENT_SHELF_LIFE_DAYS,
                )?,
                low_stock_threshold: Quantity::new(parse_or(
                    "STOCK_LOW_STOCK_THRESHOLD",
                    get("STOCK_LOW_STOCK_THRESHOLD"),
                    DEFAULT_LOW_STOCK_THRESHOLD,
                )?),
            },
            log_format,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    raw: Option<&str>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            expected: "a non-negative integer",
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_unset() {
        let config = StockConfig::from_vars(HashMap::new()).unwrap();
        assert_eq!(config, StockConfig::default());
        assert!(config.database_url.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = StockConfig::from_vars(vars(&[
            ("DATABASE_URL", "postgres://localhost/stock"),
            ("STOCK_DB_MAX_CONNECTIONS", "12"),
            ("STOCK_EXPIRY_WARNING_DAYS", "60"),
            ("STOCK_EXPIRY_CRITICAL_DAYS", "14"),
            ("STOCK_ADJUSTMENT_SHELF_LIFE_DAYS", "180"),
            ("STOCK_LOW_STOCK_THRESHOLD", "3"),
            ("STOCK_LOG_FORMAT", "text"),
        ]))
        .unwrap();

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/stock")
        );
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.policy.expiry.warning_days, 60);
        assert_eq!(config.policy.expiry.critical_days, 14);
        assert_eq!(config.policy.adjustment_shelf_life_days, 180);
        assert_eq!(config.policy.low_stock_threshold, Quantity::new(3));
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn rejects_malformed_values() {
        let err = StockConfig::from_vars(vars(&[("STOCK_EXPIRY_WARNING_DAYS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "STOCK_EXPIRY_WARNING_DAYS",
                ..
            }
        ));

        let err = StockConfig::from_vars(vars(&[("STOCK_LOG_FORMAT", "xml")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = StockConfig::from_vars(vars(&[
            ("STOCK_EXPIRY_WARNING_DAYS", "5"),
            ("STOCK_EXPIRY_CRITICAL_DAYS", "9"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }
}
