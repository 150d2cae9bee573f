//! Evaluation pass over a finite split.
//!
//! Error rates are ratios of sums: total edit errors over total reference
//! words (or characters) across every batch of the pass. The CTC loss is
//! averaged with utterance counts as weights, the adversarial loss with the
//! number of valid mask elements.
//!
//! A pass without any reference word has no defined error rate and fails.

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{DiagnosticsConfig, LossWeights};
use crate::ctc::{ctc_loss, BLANK};
use crate::data::{Batch, BatchSource, Domain, Split};
use crate::decoder::AcousticDecoder;
use crate::error::{AasError, Result};
use crate::masked_loss::masked_l1_loss;
use crate::network::{InferenceGuard, ModelSet, Network};
use crate::running_stat::RunningStat;

/// Aggregated metrics of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Split the pass ran on.
    pub split: Split,
    /// Weighted CTC loss per utterance.
    pub ctc_loss: f64,
    /// Weighted adversarial loss per valid element.
    pub adversarial_loss: f64,
    /// Total word errors over total reference words.
    pub word_error_rate: f64,
    /// Total character errors over total reference characters.
    pub char_error_rate: f64,
    /// Utterances evaluated.
    pub utterances: usize,
    /// Reference words seen.
    pub words: usize,
    /// Reference characters seen.
    pub chars: usize,
}

/// Metrics of a single batch before aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchMetrics {
    /// Weighted CTC loss divided by the batch size.
    pub ctc_loss: f64,
    /// Weighted masked adversarial loss.
    pub adversarial_loss: f64,
    /// Valid mask elements behind `adversarial_loss`.
    pub valid_elements: usize,
    /// Utterances in the batch.
    pub utterances: usize,
    /// Word edit errors.
    pub word_errors: usize,
    /// Reference words.
    pub words: usize,
    /// Character edit errors.
    pub char_errors: usize,
    /// Reference characters.
    pub chars: usize,
}

/// Running aggregation of [`BatchMetrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationTotals {
    ctc: RunningStat,
    adversarial: RunningStat,
    wer: RunningStat,
    cer: RunningStat,
    utterances: usize,
}

impl EvaluationTotals {
    /// Fold one batch.
    #[must_use]
    pub fn add(self, batch: &BatchMetrics) -> Self {
        Self {
            ctc: self.ctc.update(batch.ctc_loss, batch.utterances as f64),
            adversarial: self
                .adversarial
                .update(batch.adversarial_loss, batch.valid_elements as f64),
            wer: self.wer.add_totals(batch.word_errors as f64, batch.words as f64),
            cer: self.cer.add_totals(batch.char_errors as f64, batch.chars as f64),
            utterances: self.utterances + batch.utterances,
        }
    }

    /// Final metrics for `split`.
    pub fn finish(&self, split: Split) -> EvaluationResult {
        EvaluationResult {
            split,
            ctc_loss: self.ctc.avg(),
            adversarial_loss: self.adversarial.avg(),
            word_error_rate: self.wer.avg(),
            char_error_rate: self.cer.avg(),
            utterances: self.utterances,
            words: self.wer.count as usize,
            chars: self.cer.count as usize,
        }
    }
}

/// Randomly samples decoded transcripts for the log.
#[derive(Debug)]
pub struct TranscriptProbe {
    rng: StdRng,
    probability: f64,
}

impl TranscriptProbe {
    /// Create a probe reporting each transcript with `probability`.
    pub fn new(probability: f64, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            probability,
        }
    }

    /// Create a probe from configuration.
    pub fn from_config(config: &DiagnosticsConfig) -> Self {
        Self::new(config.transcript_probability, config.seed)
    }

    /// Draw once; true if this transcript should be reported.
    pub fn sample(&mut self) -> bool {
        self.rng.gen::<f64>() < self.probability
    }

    /// Report a transcript pair if the draw says so. Returns whether it did.
    pub fn observe(
        &mut self,
        reference: &str,
        hypothesis: &str,
        word_errors: usize,
        char_errors: usize,
    ) -> bool {
        if !self.sample() {
            return false;
        }
        let words = reference.split_whitespace().count().max(1);
        let chars = reference.chars().count().max(1);
        tracing::info!(
            reference,
            hypothesis,
            wer = word_errors as f64 / words as f64,
            cer = char_errors as f64 / chars as f64,
            "transcript sample"
        );
        true
    }
}

/// Evaluate one batch. The generator must already be in inference mode.
///
/// # Errors
///
/// Returns an error if a forward pass, the loss or decoding fails.
pub fn evaluate_batch(
    generator: &dyn Network,
    discriminator: &dyn Network,
    recognizer: &dyn Network,
    batch: &Batch,
    decoder: &dyn AcousticDecoder,
    weights: &LossWeights,
    probe: &mut TranscriptProbe,
) -> Result<BatchMetrics> {
    let n = batch.batch_size();
    let enhanced = generator.forward(&batch.features)?.detach();

    // [N, T', V] -> [T', N, V]
    let scores = recognizer.forward(&enhanced)?.detach().transpose(0, 1)?;
    let frames = scores.dim(0)?;
    let lengths = batch.output_lengths(frames);

    let decoded = decoder.decode(&scores, &lengths)?;
    let mut metrics = BatchMetrics {
        utterances: n,
        ..BatchMetrics::default()
    };
    for (labels, target) in decoded.iter().zip(batch.split_targets()) {
        let hypothesis = decoder.to_text(labels);
        let reference = decoder.to_text(target);
        let word_errors = decoder.word_errors(&hypothesis, &reference);
        let char_errors = decoder.char_errors(&hypothesis, &reference);

        metrics.word_errors += word_errors;
        metrics.char_errors += char_errors;
        metrics.words += reference.split_whitespace().count();
        metrics.chars += reference.chars().count();
        probe.observe(&reference, &hypothesis, word_errors, char_errors);
    }

    let realism = discriminator.forward(&enhanced)?;
    let adversarial = masked_l1_loss(&realism, &enhanced, &batch.mask)?;
    metrics.adversarial_loss = f64::from(adversarial.value()?) * weights.adversarial_weight;
    metrics.valid_elements = adversarial.valid;

    let ctc = ctc_loss(&scores, &batch.targets, &lengths, &batch.target_lengths, BLANK)?;
    metrics.ctc_loss = scalar(&ctc)? * weights.acoustic_weight / n as f64;

    Ok(metrics)
}

/// Run one pass over `split`, with the generator in inference mode for its
/// duration.
///
/// # Errors
///
/// Returns an error if any batch fails; the generator's mode is restored
/// either way. Returns [`AasError::DataInvariant`] if the split yields no
/// reference words, including a split without batches.
pub fn evaluate(
    models: &mut ModelSet,
    source: &mut dyn BatchSource,
    split: Split,
    decoder: &dyn AcousticDecoder,
    weights: &LossWeights,
    probe: &mut TranscriptProbe,
) -> Result<EvaluationResult> {
    let generator = InferenceGuard::new(models.generator.as_mut());
    let mut totals = EvaluationTotals::default();

    for _ in 0..source.split_len(split) {
        let batch = source.next_batch(Domain::Noisy, split)?;
        let metrics = evaluate_batch(
            &*generator,
            models.discriminator.as_ref(),
            models.recognizer.as_ref(),
            &batch,
            decoder,
            weights,
            probe,
        )?;
        totals = totals.add(&metrics);
    }

    let result = totals.finish(split);
    if result.words == 0 {
        return Err(AasError::data(format!(
            "{} split has no reference words to score",
            split.label()
        )));
    }
    tracing::debug!(
        "Evaluated {} utterances on {} split",
        result.utterances,
        split.label()
    );
    Ok(result)
}

/// Value of a scalar tensor as `f64`.
pub(crate) fn scalar(t: &Tensor) -> Result<f64> {
    Ok(f64::from(t.to_dtype(DType::F32)?.to_scalar::<f32>()?))
}
