//! Shared value types for the packet domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! meaningful values with invariants (confidence is in `[0.0, 1.0]`, word
//! ranges are non-empty and ordered) and participate in domain computations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Scores
// ---------------------------------------------------------------------------

/// How much a consumer should trust an assembled phase, in `[0.0, 1.0]`.
///
/// `1.0` means every specialist pass ran and was grounded in dictionary data;
/// degraded phases carry [`Confidence::none`].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Confidence(f64);

impl Confidence {
    /// Creates a [`Confidence`], returning `None` if `value` is outside
    /// `[0.0, 1.0]` or not finite.
    #[must_use]
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Full confidence.
    pub fn full() -> Self {
        Self(1.0)
    }

    /// Zero confidence.
    pub fn none() -> Self {
        Self(0.0)
    }

    /// Clamps `value` into range; NaN maps to zero.
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            Self(0.0)
        } else {
            Self(value.clamp(0.0, 1.0))
        }
    }

    /// Multiplies the confidence by `factor`, clamping the result.
    #[must_use]
    pub fn scaled(self, factor: f64) -> Self {
        Self::clamped(self.0 * factor)
    }

    /// Returns the score as an `f64` in `[0.0, 1.0]`.
    pub fn as_f64(self) -> f64 {
        self.0
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Sub-segment slices
// ---------------------------------------------------------------------------

/// A half-open `[start, end)` slice over the whitespace-delimited words of one
/// canonical segment.
///
/// Present on a phase only when a long segment was split across several phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WordRange {
    pub start: usize,
    pub end: usize,
}

impl WordRange {
    /// Creates a range, returning `None` when `end <= start`.
    pub fn new(start: usize, end: usize) -> Option<Self> {
        (end > start).then_some(Self { start, end })
    }

    /// Number of words covered.
    pub fn len(self) -> usize {
        self.end - self.start
    }

    /// Always `false`; ranges are non-empty by construction.
    pub fn is_empty(self) -> bool {
        false
    }

    /// Returns `true` if the two ranges share at least one word.
    pub fn overlaps(self, other: WordRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Applies the range to a word list, clamping to its length.
    pub fn slice<'a, T>(self, items: &'a [T]) -> &'a [T] {
        let end = self.end.min(items.len());
        let start = self.start.min(end);
        &items[start..end]
    }
}

impl std::fmt::Display for WordRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_rejects_out_of_range() {
        assert!(Confidence::new(1.2).is_none());
        assert!(Confidence::new(f64::NAN).is_none());
        assert_eq!(Confidence::full().scaled(0.5).as_f64(), 0.5);
        assert_eq!(Confidence::clamped(-3.0).as_f64(), 0.0);
    }

    #[test]
    fn word_ranges_slice_and_overlap() {
        let words = ["a", "b", "c", "d"];
        let r = WordRange::new(1, 3).unwrap();
        assert_eq!(r.slice(&words), &["b", "c"]);
        assert!(WordRange::new(2, 2).is_none());
        assert!(r.overlaps(WordRange::new(2, 4).unwrap()));
        assert!(!r.overlaps(WordRange::new(3, 4).unwrap()));
        assert_eq!(WordRange::new(2, 9).unwrap().slice(&words), &["c", "d"]);
    }
}
