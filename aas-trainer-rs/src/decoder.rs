//! Greedy CTC decoding and edit-distance error counts.

use candle_core::{DType, Tensor, D};

use crate::ctc::BLANK;
use crate::error::{AasError, Result};

/// Turns recognizer scores into transcripts and scores them.
pub trait AcousticDecoder {
    /// Decode `[T, N, V]` scores, reading `lengths[n]` frames of utterance
    /// `n`. Returns label ids per utterance.
    ///
    /// # Errors
    ///
    /// Returns an error if the scores have the wrong shape or a length
    /// exceeds `T`.
    fn decode(&self, scores: &Tensor, lengths: &[usize]) -> Result<Vec<Vec<u32>>>;

    /// Render label ids as text.
    fn to_text(&self, labels: &[u32]) -> String;

    /// Word-level edit distance between hypothesis and reference.
    fn word_errors(&self, hypothesis: &str, reference: &str) -> usize {
        let hyp: Vec<&str> = hypothesis.split_whitespace().collect();
        let reference: Vec<&str> = reference.split_whitespace().collect();
        levenshtein(&hyp, &reference)
    }

    /// Character-level edit distance, ignoring spaces.
    fn char_errors(&self, hypothesis: &str, reference: &str) -> usize {
        let hyp: Vec<char> = hypothesis.chars().filter(|c| *c != ' ').collect();
        let reference: Vec<char> = reference.chars().filter(|c| *c != ' ').collect();
        levenshtein(&hyp, &reference)
    }
}

/// Arg-max decoder: best label per frame, repeats collapsed, blanks dropped.
#[derive(Debug, Clone)]
pub struct GreedyDecoder {
    labels: Vec<char>,
    blank: u32,
}

impl GreedyDecoder {
    /// Create a decoder over an alphabet whose index 0 is the blank.
    pub fn new(alphabet: &str) -> Self {
        Self {
            labels: alphabet.chars().collect(),
            blank: BLANK,
        }
    }

    /// Alphabet size.
    pub fn vocab_size(&self) -> usize {
        self.labels.len()
    }

    /// Label ids for a text, skipping characters outside the alphabet.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        text.chars()
            .filter_map(|c| {
                self.labels
                    .iter()
                    .position(|l| *l == c)
                    .filter(|i| *i as u32 != self.blank)
                    .map(|i| i as u32)
            })
            .collect()
    }

    fn collapse(&self, frames: &[u32]) -> Vec<u32> {
        let mut out = Vec::new();
        let mut prev = None;
        for &label in frames {
            if Some(label) != prev && label != self.blank {
                out.push(label);
            }
            prev = Some(label);
        }
        out
    }
}

impl AcousticDecoder for GreedyDecoder {
    fn decode(&self, scores: &Tensor, lengths: &[usize]) -> Result<Vec<Vec<u32>>> {
        let (frames, batch, _) = scores.dims3()?;
        if lengths.len() != batch {
            return Err(AasError::data(format!(
                "decode: {batch} utterances but {} lengths",
                lengths.len()
            )));
        }

        // [T, N] -> [N, T]
        let best = scores
            .to_dtype(DType::F32)?
            .argmax(D::Minus1)?
            .t()?
            .contiguous()?
            .to_dtype(DType::U32)?
            .to_vec2::<u32>()?;

        best.iter()
            .zip(lengths)
            .map(|(row, &len)| {
                if len > frames {
                    return Err(AasError::data(format!(
                        "decode: length {len} exceeds {frames} frames"
                    )));
                }
                Ok(self.collapse(&row[..len]))
            })
            .collect()
    }

    fn to_text(&self, labels: &[u32]) -> String {
        labels
            .iter()
            .filter_map(|l| self.labels.get(*l as usize))
            .collect()
    }
}

/// Edit distance between two token sequences.
pub fn levenshtein<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, x) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let cost = usize::from(x != y);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}
