//! Primary-key scan bounds.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::key::{immediate_successor, max_start_bound, min_end_bound, KeyRange};

/// Encoded lower (inclusive) and upper (exclusive) primary-key bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanBounds {
    lower: Option<Vec<u8>>,
    upper_exclusive: Option<Vec<u8>>,
}

impl ScanBounds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lower(&self) -> Option<&[u8]> {
        self.lower.as_deref()
    }

    pub fn upper_exclusive(&self) -> Option<&[u8]> {
        self.upper_exclusive.as_deref()
    }

    /// Adds an inclusive lower bound; the tighter of repeated bounds wins.
    pub fn add_lower(&mut self, key: Vec<u8>) -> Result<()> {
        let lower = match &self.lower {
            Some(existing) => max_start_bound(existing, &key),
            None => key,
        };
        check_order(Some(&lower), self.upper_exclusive.as_deref())?;
        self.lower = Some(lower);
        Ok(())
    }

    /// Adds an upper bound; an inclusive bound is stored as its successor.
    pub fn add_upper(&mut self, key: Vec<u8>, inclusive: bool) -> Result<()> {
        let key = if inclusive {
            immediate_successor(&key)
        } else {
            key
        };
        // An empty exclusive upper bound admits no key at all.
        let upper = match &self.upper_exclusive {
            Some(existing) if existing.is_empty() || key.is_empty() => Vec::new(),
            Some(existing) => min_end_bound(existing, &key),
            None => key,
        };
        check_order(self.lower.as_deref(), Some(&upper))?;
        self.upper_exclusive = Some(upper);
        Ok(())
    }

    /// Key range covered by the bounds; unset sides are unbounded.
    pub fn key_range(&self) -> KeyRange {
        if matches!(&self.upper_exclusive, Some(upper) if upper.is_empty()) {
            return KeyRange::empty();
        }
        KeyRange::new(
            self.lower.clone().unwrap_or_default(),
            self.upper_exclusive.clone().unwrap_or_default(),
        )
    }
}

fn check_order(lower: Option<&[u8]>, upper: Option<&[u8]>) -> Result<()> {
    if let (Some(lower), Some(upper)) = (lower, upper) {
        if lower > upper {
            return Err(ScanError::invalid_bound(format!(
                "lower bound {} is above upper bound {}",
                hex::encode(lower),
                hex::encode(upper)
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_bounds_keep_the_tightest() {
        let mut bounds = ScanBounds::new();
        bounds.add_lower(vec![0x10]).expect("lower");
        bounds.add_lower(vec![0x05]).expect("lower");
        bounds.add_upper(vec![0x40], false).expect("upper");
        bounds.add_upper(vec![0x30], false).expect("upper");
        assert_eq!(bounds.key_range(), KeyRange::new(vec![0x10], vec![0x30]));
    }

    #[test]
    fn inclusive_upper_becomes_successor() {
        let mut bounds = ScanBounds::new();
        bounds.add_upper(vec![0x20], true).expect("upper");
        let range = bounds.key_range();
        assert!(range.contains(&[0x20]));
        assert!(!range.contains(&[0x20, 0x01]));
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let mut bounds = ScanBounds::new();
        bounds.add_upper(vec![0x10], false).expect("upper");
        let err = bounds.add_lower(vec![0x20]).expect_err("inverted");
        assert!(matches!(err, ScanError::InvalidBound { .. }));
        assert_eq!(bounds.lower(), None);
    }

    #[test]
    fn equal_bounds_are_valid_but_empty() {
        let mut bounds = ScanBounds::new();
        bounds.add_lower(vec![0x10]).expect("lower");
        bounds.add_upper(vec![0x10], false).expect("upper");
        assert!(bounds.key_range().is_empty());
    }
}
