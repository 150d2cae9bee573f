//! Batches and the batch source the trainer draws from.
//!
//! Loading, feature extraction and batching happen elsewhere; this module
//! only fixes what a batch must look like and validates it on construction.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{AasError, Result};

/// Acoustic domain of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Noisy speech, the generator's input.
    Noisy,
    /// Clean speech, the discriminator's "real" examples.
    Clean,
}

/// Data split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    /// Endless shuffled training stream.
    Train,
    /// Finite subset of the training data used for evaluation.
    TrainSubset,
    /// Finite held-out validation data.
    Validation,
}

impl Split {
    /// Name used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::TrainSubset => "training subset",
            Split::Validation => "validation",
        }
    }
}

/// One batch of utterances.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Spectral features `[N, F, T]`.
    pub features: Tensor,
    /// Concatenated transcript label ids.
    pub targets: Vec<u32>,
    /// Label count of each utterance.
    pub target_lengths: Vec<usize>,
    /// Fraction of `T` that holds real audio, per utterance.
    pub input_fractions: Vec<f32>,
    /// Validity mask, broadcastable to `features`.
    pub mask: Tensor,
}

impl Batch {
    /// Create a validated batch.
    ///
    /// # Errors
    ///
    /// Returns [`AasError::DataInvariant`] if the features are not rank 3,
    /// per-utterance vectors have the wrong length, target lengths do not
    /// sum to the number of targets, or a fraction is outside `(0, 1]`.
    pub fn new(
        features: Tensor,
        targets: Vec<u32>,
        target_lengths: Vec<usize>,
        input_fractions: Vec<f32>,
        mask: Tensor,
    ) -> Result<Self> {
        let dims = features.dims();
        if dims.len() != 3 {
            return Err(AasError::data(format!(
                "features must be [N, F, T], got {dims:?}"
            )));
        }
        let n = dims[0];

        if target_lengths.len() != n || input_fractions.len() != n {
            return Err(AasError::data(format!(
                "batch of {n} utterances has {} target lengths and {} input fractions",
                target_lengths.len(),
                input_fractions.len()
            )));
        }

        let total: usize = target_lengths.iter().sum();
        if total != targets.len() {
            return Err(AasError::data(format!(
                "target lengths sum to {total} but {} targets were given",
                targets.len()
            )));
        }

        if let Some(bad) = input_fractions
            .iter()
            .find(|f| !(**f > 0.0 && **f <= 1.0))
        {
            return Err(AasError::data(format!(
                "input fraction {bad} is outside (0, 1]"
            )));
        }

        Ok(Self {
            features,
            targets,
            target_lengths,
            input_fractions,
            mask,
        })
    }

    /// Number of utterances.
    pub fn batch_size(&self) -> usize {
        self.features.dims()[0]
    }

    /// Targets split back into one slice per utterance.
    pub fn split_targets(&self) -> Vec<&[u32]> {
        let mut out = Vec::with_capacity(self.target_lengths.len());
        let mut offset = 0;
        for &len in &self.target_lengths {
            out.push(&self.targets[offset..offset + len]);
            offset += len;
        }
        out
    }

    /// Valid output frames per utterance for a model emitting `frames`
    /// frames: `floor(fraction * frames)`.
    pub fn output_lengths(&self, frames: usize) -> Vec<usize> {
        self.input_fractions
            .iter()
            .map(|f| ((f64::from(*f) * frames as f64) as usize).min(frames))
            .collect()
    }
}

/// Source of fixed-shape batches.
///
/// `Train` must never run dry. `TrainSubset` and `Validation` are finite and
/// repeatable: [`BatchSource::split_len`] batches are drawn per evaluation
/// pass, and the next pass starts again from the beginning.
pub trait BatchSource {
    /// Draw the next batch of `domain` from `split`.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be produced.
    fn next_batch(&mut self, domain: Domain, split: Split) -> Result<Batch>;

    /// Number of batches in one pass over a finite split.
    fn split_len(&self, split: Split) -> usize;
}
