//! Masked L1 distance used as the discriminator's realism loss.
//!
//! The loss is `sum(|P - R| * M) / sum(M)`. Dividing by the mask weight (and
//! not by the number of non-zero entries) keeps the value unchanged when the
//! whole mask is scaled by a positive constant; for 0/1 masks both are equal.
//! The number of non-zero mask entries is returned next to the loss so
//! evaluation can weight batches of different validity.
//!
//! An all-zero mask is rejected with [`AasError::DataInvariant`]. Returning
//! zero would silently remove the batch from the adversarial objective.

use candle_core::{DType, Tensor};

use crate::error::{AasError, Result};

/// Loss tensor plus the number of valid (unmasked) elements behind it.
#[derive(Debug, Clone)]
pub struct MaskedLoss {
    /// Scalar loss, still attached to the autograd graph.
    pub loss: Tensor,
    /// Count of non-zero mask entries after broadcasting.
    pub valid: usize,
}

impl MaskedLoss {
    /// Scale the loss, keeping the valid count.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor op fails.
    pub fn scaled(&self, factor: f64) -> Result<Tensor> {
        Ok((&self.loss * factor)?)
    }

    /// Loss value as `f32`.
    ///
    /// # Errors
    ///
    /// Returns an error if the loss is not a scalar.
    pub fn value(&self) -> Result<f32> {
        Ok(self.loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }
}

/// Compute the masked, mask-normalized L1 distance between `pred` and
/// `reference`.
///
/// `mask` must broadcast to the shape of `pred`; `reference` must have the
/// same shape as `pred`.
///
/// # Errors
///
/// Returns [`AasError::DataInvariant`] if the shapes disagree or the mask
/// has no valid entry.
pub fn masked_l1_loss(pred: &Tensor, reference: &Tensor, mask: &Tensor) -> Result<MaskedLoss> {
    if pred.dims() != reference.dims() {
        return Err(AasError::data(format!(
            "masked loss operands differ in shape: {:?} vs {:?}",
            pred.dims(),
            reference.dims()
        )));
    }

    let mask = mask
        .to_dtype(pred.dtype())?
        .broadcast_as(pred.shape())
        .map_err(|e| {
            AasError::data(format!(
                "mask {:?} does not broadcast to {:?}: {e}",
                mask.dims(),
                pred.dims()
            ))
        })?;

    let mask_values = mask.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let valid = mask_values.iter().filter(|v| **v != 0.0).count();
    let weight: f64 = mask_values.iter().map(|v| f64::from(*v)).sum();

    if valid == 0 || weight == 0.0 {
        return Err(AasError::data(format!(
            "mask over {:?} has no valid entries",
            pred.dims()
        )));
    }

    let total = (pred - reference)?.abs()?.mul(&mask)?.sum_all()?;
    let loss = (total / weight)?;

    Ok(MaskedLoss { loss, valid })
}
