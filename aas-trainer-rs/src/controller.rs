//! Proportional controller balancing generator and discriminator.
//!
//! The weight `k` scales the discriminator's (negated) realism loss on
//! enhanced speech. Each step moves `k` by `lambda_k * (gamma * L_clean -
//! L_enhanced)` and clamps it to `[0, 1]`. When enhanced speech already looks
//! as real as `gamma` times clean speech, `k` stops growing.

use serde::{Deserialize, Serialize};

use crate::config::ControllerConfig;

/// Outcome of one controller update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerStep {
    /// Weight after the update.
    pub weight: f64,
    /// `gamma * clean_loss - noisy_loss`.
    pub gap: f64,
    /// `clean_loss + |gap|`; falls as the adversarial game converges.
    pub convergence: f64,
}

/// Controller state: the weight plus its fixed parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlledWeight {
    weight: f64,
    gamma: f64,
    lambda_k: f64,
}

impl ControlledWeight {
    /// Create a controller. The initial weight is clamped to `[0, 1]`.
    pub fn new(initial_weight: f64, gamma: f64, lambda_k: f64) -> Self {
        Self {
            weight: clamp_unit(initial_weight),
            gamma,
            lambda_k,
        }
    }

    /// Create a controller from configuration.
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.initial_weight, config.gamma, config.lambda_k)
    }

    /// Current weight.
    #[inline]
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Target ratio.
    #[inline]
    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    /// Controller gain.
    #[inline]
    pub fn lambda_k(&self) -> f64 {
        self.lambda_k
    }

    /// Apply one proportional update from the clean-input realism loss and
    /// the generator-side realism loss on enhanced input.
    pub fn update(&mut self, clean_adv_loss: f64, noisy_adv_loss: f64) -> ControllerStep {
        let gap = self.gamma * clean_adv_loss - noisy_adv_loss;
        self.weight = clamp_unit(self.weight + self.lambda_k * gap);
        ControllerStep {
            weight: self.weight,
            gap,
            convergence: clean_adv_loss + gap.abs(),
        }
    }
}

/// Clamp to `[0, 1]`; NaN collapses to 0 so the weight never leaves the range.
fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
