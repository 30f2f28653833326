//! Human-readable document references: `<PREFIX>-<YYYYMMDD>-<SUFFIX>`.
//!
//! The suffix is six characters from `[A-Z0-9]`. Uniqueness is advisory; the
//! format is what exports depend on.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};

pub const SUFFIX_LEN: usize = 6;

const ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Prefix used for inventory count sessions.
pub const INVENTORY_PREFIX: &str = "INV";
/// Prefix used for stock transfers.
pub const TRANSFER_PREFIX: &str = "TRF";

/// Generates references for a document type on a given date.
pub trait ReferenceGenerator: Send + Sync {
    fn next_reference(&self, prefix: &str, date: NaiveDate) -> String;
}

/// Render a reference from its parts, validating the suffix.
pub fn format_reference(prefix: &str, date: NaiveDate, suffix: &str) -> DomainResult<String> {
    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(DomainError::invalid_argument(format!(
            "reference prefix must be uppercase letters, got '{prefix}'"
        )));
    }
    if suffix.len() != SUFFIX_LEN || !suffix.bytes().all(|b| ALPHABET.contains(&b)) {
        return Err(DomainError::invalid_argument(format!(
            "reference suffix must be {SUFFIX_LEN} characters of [A-Z0-9], got '{suffix}'"
        )));
    }
    Ok(format!("{prefix}-{}-{suffix}", date.format("%Y%m%d")))
}

/// Check that a string follows the reference layout for `prefix`.
pub fn is_valid_reference(prefix: &str, reference: &str) -> bool {
    let mut parts = reference.splitn(3, '-');
    let (Some(p), Some(date), Some(suffix)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    p == prefix
        && date.len() == 8
        && NaiveDate::parse_from_str(date, "%Y%m%d").is_ok()
        && suffix.len() == SUFFIX_LEN
        && suffix.bytes().all(|b| ALPHABET.contains(&b))
}

/// Random suffixes drawn from a v4 UUID.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomReferenceGenerator;

impl RandomReferenceGenerator {
    fn random_suffix() -> String {
        Uuid::new_v4()
            .as_bytes()
            .iter()
            .take(SUFFIX_LEN)
            .map(|b| ALPHABET[usize::from(*b) % ALPHABET.len()] as char)
            .collect()
    }
}

impl ReferenceGenerator for RandomReferenceGenerator {
    fn next_reference(&self, prefix: &str, date: NaiveDate) -> String {
        format!("{prefix}-{}-{}", date.format("%Y%m%d"), Self::random_suffix())
    }
}

/// Hands out pre-seeded suffixes, then a zero-padded counter.
#[derive(Debug, Default)]
pub struct SequenceReferenceGenerator {
    suffixes: Mutex<VecDeque<String>>,
    counter: Mutex<u64>,
}

impl SequenceReferenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_suffixes<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            suffixes: Mutex::new(suffixes.into_iter().map(Into::into).collect()),
            counter: Mutex::new(0),
        }
    }

    fn next_suffix(&self) -> String {
        if let Ok(mut seeded) = self.suffixes.lock() {
            if let Some(s) = seeded.pop_front() {
                return s;
            }
        }
        let n = match self.counter.lock() {
            Ok(mut c) => {
                *c += 1;
                *c
            }
            Err(_) => 0,
        };
        format!("{n:06}")
    }
}

impl ReferenceGenerator for SequenceReferenceGenerator {
    fn next_reference(&self, prefix: &str, date: NaiveDate) -> String {
        format!("{prefix}-{}-{}", date.format("%Y%m%d"), self.next_suffix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 7).unwrap()
    }

    #[test]
    fn format_is_prefix_date_suffix() {
        assert_eq!(
            format_reference("INV", day(), "AB12CD").unwrap(),
            "INV-20240507-AB12CD"
        );
        assert!(format_reference("INV", day(), "ab12cd").is_err());
        assert!(format_reference("INV", day(), "AB12C").is_err());
    }

    #[test]
    fn random_references_are_well_formed() {
        let generator = RandomReferenceGenerator;
        for _ in 0..200 {
            let reference = generator.next_reference(TRANSFER_PREFIX, day());
            assert!(is_valid_reference(TRANSFER_PREFIX, &reference), "{reference}");
            assert!(reference.starts_with("TRF-20240507-"));
        }
    }

    #[test]
    fn sequence_generator_uses_seeds_then_counter() {
        let generator = SequenceReferenceGenerator::with_suffixes(["QWERTY"]);
        assert_eq!(
            generator.next_reference(INVENTORY_PREFIX, day()),
            "INV-20240507-QWERTY"
        );
        assert_eq!(
            generator.next_reference(INVENTORY_PREFIX, day()),
            "INV-20240507-000001"
        );
    }
}
