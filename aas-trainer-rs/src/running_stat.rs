//! Weighted running averages.
//!
//! [`RunningStat`] is a plain value: updating returns a new accumulator and
//! the caller decides where it lives. The trainer keeps the short-window CTC
//! average in its loop state and evaluation folds fresh accumulators per pass,
//! so "reset" is just starting again from [`RunningStat::default`].

use serde::{Deserialize, Serialize};

/// Weighted sum and total weight of a stream of scalar observations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStat {
    /// Sum of `value * weight` over all observations.
    pub sum: f64,
    /// Sum of all weights.
    pub count: f64,
}

impl RunningStat {
    /// Fold one observation with its weight (usually a sample or word count).
    ///
    /// A zero weight leaves the accumulator unchanged, so a non-finite value
    /// carried by an empty batch cannot leak into the average.
    #[must_use]
    pub fn update(self, value: f64, weight: f64) -> Self {
        if weight == 0.0 {
            return self;
        }
        Self {
            sum: self.sum + value * weight,
            count: self.count + weight,
        }
    }

    /// Fold raw totals, e.g. `(errors, words)` of one batch.
    #[must_use]
    pub fn add_totals(self, total: f64, count: f64) -> Self {
        Self {
            sum: self.sum + total,
            count: self.count + count,
        }
    }

    /// Combine two accumulators.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        self.add_totals(other.sum, other.count)
    }

    /// Weighted mean, or 0 when nothing has been observed.
    pub fn avg(&self) -> f64 {
        if self.count == 0.0 {
            0.0
        } else {
            self.sum / self.count
        }
    }

    /// Whether any weight has been folded in.
    pub fn is_empty(&self) -> bool {
        self.count == 0.0
    }
}
