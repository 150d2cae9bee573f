//! Connectionist temporal classification loss.
//!
//! candle has no CTC kernel, so the forward recursion is written with tensor
//! ops and differentiated by autograd. Log-probabilities are kept in log
//! space; "minus infinity" is a large negative constant so that
//! `logsumexp` over impossible states stays finite and its gradient is zero
//! instead of NaN.

use candle_core::{DType, Device, IndexOp, Tensor, D};

use crate::error::{AasError, Result};

/// Blank label id used by the recognizer.
pub const BLANK: u32 = 0;

const NEG: f32 = -1e30;
const INFEASIBLE: f32 = -1e29;

/// Summed CTC negative log-likelihood over a batch.
///
/// * `logits` - unnormalized scores `[T, N, V]`
/// * `targets` - concatenated label ids of all utterances
/// * `input_lengths` - valid frames per utterance, at most `T`
/// * `target_lengths` - labels per utterance, summing to `targets.len()`
///
/// Returns a scalar tensor; divide by `N` for the per-utterance mean.
///
/// # Errors
///
/// Returns [`AasError::DataInvariant`] if lengths are inconsistent, a label
/// is the blank or out of vocabulary, or an utterance has too few frames for
/// any alignment of its transcript.
pub fn ctc_loss(
    logits: &Tensor,
    targets: &[u32],
    input_lengths: &[usize],
    target_lengths: &[usize],
    blank: u32,
) -> Result<Tensor> {
    let (frames, batch, vocab) = logits.dims3()?;
    if input_lengths.len() != batch || target_lengths.len() != batch {
        return Err(AasError::data(format!(
            "ctc: {batch} utterances but {} input lengths and {} target lengths",
            input_lengths.len(),
            target_lengths.len()
        )));
    }
    if target_lengths.iter().sum::<usize>() != targets.len() {
        return Err(AasError::data("ctc: target lengths do not sum to the number of targets"));
    }
    if blank as usize >= vocab {
        return Err(AasError::data(format!("ctc: blank {blank} outside vocabulary of {vocab}")));
    }

    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;

    let mut losses = Vec::with_capacity(batch);
    let mut offset = 0;
    for n in 0..batch {
        let labels = &targets[offset..offset + target_lengths[n]];
        offset += target_lengths[n];

        let len = input_lengths[n];
        if len == 0 || len > frames {
            return Err(AasError::data(format!(
                "ctc: utterance {n} has input length {len} for {frames} frames"
            )));
        }
        if let Some(bad) = labels.iter().find(|l| **l == blank || **l as usize >= vocab) {
            return Err(AasError::data(format!(
                "ctc: utterance {n} has invalid label {bad}"
            )));
        }
        let required = min_frames(labels);
        if len < required {
            return Err(AasError::data(format!(
                "ctc: utterance {n} needs at least {required} frames, has {len}"
            )));
        }

        let lp = log_probs.i((..len, n, ..))?.contiguous()?;
        losses.push(sample_nll(&lp, labels, blank)?);
    }

    Ok(Tensor::stack(&losses, 0)?.sum_all()?)
}

/// Minimum frames for an alignment: one per label plus a blank between
/// repeated neighbours.
pub fn min_frames(labels: &[u32]) -> usize {
    labels.len() + labels.windows(2).filter(|w| w[0] == w[1]).count()
}

/// Negative log-likelihood of one utterance from its `[T, V]` log-probs.
fn sample_nll(lp: &Tensor, labels: &[u32], blank: u32) -> Result<Tensor> {
    let device = lp.device();
    let frames = lp.dim(0)?;

    if labels.is_empty() {
        // Only the all-blank path.
        let ll = lp.i((.., blank as usize))?.sum_all()?;
        return Ok(ll.neg()?);
    }

    let mut extended = Vec::with_capacity(2 * labels.len() + 1);
    extended.push(blank);
    for &label in labels {
        extended.push(label);
        extended.push(blank);
    }
    let states = extended.len();

    let index = Tensor::from_vec(extended.clone(), states, device)?;
    let emissions = lp.index_select(&index, 1)?;

    let skip: Vec<f32> = (0..states)
        .map(|s| {
            if s >= 2 && extended[s] != blank && extended[s] != extended[s - 2] {
                0.0
            } else {
                NEG
            }
        })
        .collect();
    let skip = Tensor::from_vec(skip, states, device)?;

    let start: Vec<f32> = (0..states).map(|s| if s < 2 { 0.0 } else { NEG }).collect();
    let start = Tensor::from_vec(start, states, device)?;

    let pad1 = filled(1, device)?;
    let pad2 = filled(2, device)?;

    let mut alpha = (emissions.get(0)? + start)?;
    for t in 1..frames {
        let stay = alpha.clone();
        let step = Tensor::cat(&[&pad1, &alpha.narrow(0, 0, states - 1)?], 0)?;
        let jump = (Tensor::cat(&[&pad2, &alpha.narrow(0, 0, states - 2)?], 0)? + &skip)?;
        alpha = (logsumexp(&[stay, step, jump])? + emissions.get(t)?)?;
    }

    let tail = alpha.narrow(0, states - 2, 2)?;
    let ll = logsumexp(&[tail.get(0)?, tail.get(1)?])?;

    if ll.to_scalar::<f32>()? < INFEASIBLE {
        return Err(AasError::data("ctc: transcript has no feasible alignment"));
    }
    Ok(ll.neg()?)
}

fn filled(len: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::full(NEG, len, device)?)
}

/// Element-wise `log(sum(exp(x)))` over same-shaped tensors.
fn logsumexp(terms: &[Tensor]) -> Result<Tensor> {
    let stacked = Tensor::stack(terms, 0)?;
    let max = stacked.max_keepdim(0)?.detach();
    let summed = stacked.broadcast_sub(&max)?.exp()?.sum_keepdim(0)?.log()?;
    Ok((summed + max)?.squeeze(0)?)
}
