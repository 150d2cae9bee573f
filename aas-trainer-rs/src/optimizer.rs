//! Adam with optional AMSGrad, stepping a [`VarMap`] from collected gradients.
//!
//! candle's built-in optimizers run their own backward pass. The training
//! step here accumulates scoped gradients over several backward passes
//! first, so the update is applied from a [`Gradients`] value instead.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use candle_nn::VarMap;

use crate::config::OptimConfig;
use crate::error::{AasError, Result};
use crate::gradients::Gradients;

const EPS: f64 = 1e-8;

/// Per-parameter moment estimates.
struct Moments {
    m: Tensor,
    v: Tensor,
    v_max: Option<Tensor>,
}

/// Adam optimizer for one model.
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    weight_decay: f64,
    amsgrad: bool,
    state: HashMap<String, Moments>,
    t: u64,
}

impl Adam {
    /// Create an optimizer from configuration.
    pub fn new(config: &OptimConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            weight_decay: config.weight_decay,
            amsgrad: config.amsgrad,
            state: HashMap::new(),
            t: 0,
        }
    }

    /// Apply one update to every variable in `vars` that has a gradient.
    ///
    /// Parameters without a gradient keep their value and moments. An empty
    /// gradient set is a no-op and does not advance the step counter.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor op fails or the store lock is poisoned.
    pub fn step(&mut self, vars: &VarMap, grads: &Gradients) -> Result<()> {
        if grads.is_empty() {
            return Ok(());
        }
        self.t += 1;

        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);
        let step_size = self.learning_rate / bc1;

        let data = vars
            .data()
            .lock()
            .map_err(|_| AasError::training("parameter store lock poisoned"))?;

        for (name, var) in data.iter() {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let param = var.as_tensor().detach();
            let mut grad = grad.to_dtype(DType::F32)?;
            if self.weight_decay != 0.0 {
                grad = (grad + (param.to_dtype(DType::F32)? * self.weight_decay)?)?;
            }

            let moments = match self.state.remove(name) {
                Some(moments) => moments,
                None => Moments {
                    m: grad.zeros_like()?,
                    v: grad.zeros_like()?,
                    v_max: if self.amsgrad {
                        Some(grad.zeros_like()?)
                    } else {
                        None
                    },
                },
            };

            // m = b1 * m + (1 - b1) * g
            let m = ((&moments.m * self.beta1)? + (&grad * (1.0 - self.beta1))?)?;
            // v = b2 * v + (1 - b2) * g^2
            let v = ((&moments.v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

            let v_max = match moments.v_max {
                Some(prev) => Some(prev.maximum(&v)?),
                None => None,
            };
            let second = v_max.as_ref().unwrap_or(&v);

            let denom = ((second.sqrt()? / bc2.sqrt())? + EPS)?;
            let update = ((&m / &denom)? * step_size)?;
            let new_param = (param.to_dtype(DType::F32)? - update)?.to_dtype(var.dtype())?;
            var.set(&new_param)?;

            self.state.insert(name.clone(), Moments { m, v, v_max });
        }

        Ok(())
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.t
    }
}
