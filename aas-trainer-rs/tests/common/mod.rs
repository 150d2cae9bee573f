//! Shared fixtures: tiny per-frame networks and an in-memory batch source.

#![allow(dead_code)]

use std::collections::HashMap;

use aas_trainer_rs::{
    AasConfig, Batch, BatchSource, Domain, GreedyDecoder, ModelSet, Network, Result, Split,
};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder, VarMap};

/// Alphabet with the blank at index 0.
pub const ALPHABET: &str = "_abc ";
/// Feature bins per frame.
pub const FEATURES: usize = 3;
/// Frames per utterance.
pub const FRAMES: usize = 8;

/// Linear map applied independently to every frame of `[N, F, T]`.
pub struct FrameNet {
    vars: VarMap,
    layer: Linear,
    training: bool,
    /// Output `[N, T, out]` instead of `[N, out, T]`.
    time_major_output: bool,
}

impl FrameNet {
    pub fn new(
        input: usize,
        output: usize,
        time_major_output: bool,
        device: &Device,
    ) -> Result<Self> {
        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, device);
        let layer = candle_nn::linear(input, output, vb.pp("frame"))?;
        Ok(Self {
            vars,
            layer,
            training: true,
            time_major_output,
        })
    }
}

impl Network for FrameNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.layer.forward(&xs.transpose(1, 2)?)?;
        if self.time_major_output {
            Ok(ys)
        } else {
            Ok(ys.transpose(1, 2)?)
        }
    }

    fn vars(&self) -> &VarMap {
        &self.vars
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// Recognizer that always emits a strong score for one label.
pub struct ConstantRecognizer {
    vars: VarMap,
    label: usize,
    vocab: usize,
    training: bool,
}

impl ConstantRecognizer {
    pub fn new(label: usize, vocab: usize) -> Self {
        Self {
            vars: VarMap::new(),
            label,
            vocab,
            training: true,
        }
    }
}

impl Network for ConstantRecognizer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (n, _, t) = xs.dims3()?;
        let mut data = vec![0f32; n * t * self.vocab];
        for row in data.chunks_mut(self.vocab) {
            row[self.label] = 8.0;
        }
        Ok(Tensor::from_vec(data, (n, t, self.vocab), xs.device())?)
    }

    fn vars(&self) -> &VarMap {
        &self.vars
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// Generator, discriminator and recognizer made of frame networks.
pub fn frame_models(device: &Device) -> ModelSet {
    let vocab = ALPHABET.chars().count();
    ModelSet::new(
        Box::new(FrameNet::new(FEATURES, FEATURES, false, device).unwrap()),
        Box::new(FrameNet::new(FEATURES, FEATURES, false, device).unwrap()),
        Box::new(FrameNet::new(FEATURES, vocab, true, device).unwrap()),
    )
}

/// Like [`frame_models`], but the recognizer always decodes to "a", so
/// error rates stay fixed while the generator trains.
pub fn constant_recognizer_models(device: &Device) -> ModelSet {
    let vocab = ALPHABET.chars().count();
    ModelSet::new(
        Box::new(FrameNet::new(FEATURES, FEATURES, false, device).unwrap()),
        Box::new(FrameNet::new(FEATURES, FEATURES, false, device).unwrap()),
        Box::new(ConstantRecognizer::new(1, vocab)),
    )
}

/// Overwrite every parameter of `to` with the same-named one of `from`.
pub fn copy_vars(from: &VarMap, to: &VarMap) {
    let from = from.data().lock().unwrap();
    let to = to.data().lock().unwrap();
    for (name, var) in from.iter() {
        to[name].set(var.as_tensor()).unwrap();
    }
}

/// Batch of `texts` with deterministic features; the mask covers the
/// valid fraction of every utterance.
pub fn make_batch(texts: &[&str], fractions: &[f32], seed: usize, device: &Device) -> Batch {
    let decoder = GreedyDecoder::new(ALPHABET);
    let n = texts.len();

    let mut targets = Vec::new();
    let mut target_lengths = Vec::new();
    for text in texts {
        let ids = decoder.encode(text);
        target_lengths.push(ids.len());
        targets.extend(ids);
    }

    let features: Vec<f32> = (0..n * FEATURES * FRAMES)
        .map(|i| ((i + seed * 31) as f32 * 0.37).sin())
        .collect();
    let features = Tensor::from_vec(features, (n, FEATURES, FRAMES), device).unwrap();

    let mut mask = vec![0f32; n * FRAMES];
    for (i, fraction) in fractions.iter().enumerate() {
        let valid = (f64::from(*fraction) * FRAMES as f64) as usize;
        for t in 0..valid {
            mask[i * FRAMES + t] = 1.0;
        }
    }
    let mask = Tensor::from_vec(mask, (n, 1, FRAMES), device).unwrap();

    Batch::new(features, targets, target_lengths, fractions.to_vec(), mask).unwrap()
}

/// Cycles through fixed batches per domain and split.
#[derive(Default)]
pub struct ListSource {
    batches: HashMap<(Domain, Split), Vec<Batch>>,
    cursors: HashMap<(Domain, Split), usize>,
    pub drawn: usize,
}

impl ListSource {
    pub fn with(mut self, domain: Domain, split: Split, batches: Vec<Batch>) -> Self {
        self.batches.insert((domain, split), batches);
        self
    }
}

impl BatchSource for ListSource {
    fn next_batch(&mut self, domain: Domain, split: Split) -> Result<Batch> {
        let batches = self.batches.get(&(domain, split)).ok_or_else(|| {
            aas_trainer_rs::AasError::data(format!("no {domain:?} {split:?} batches"))
        })?;
        let cursor = self.cursors.entry((domain, split)).or_insert(0);
        let batch = batches[*cursor % batches.len()].clone();
        *cursor += 1;
        self.drawn += 1;
        Ok(batch)
    }

    fn split_len(&self, split: Split) -> usize {
        self.batches
            .get(&(Domain::Noisy, split))
            .map_or(0, Vec::len)
    }
}

/// Source with training, subset and validation batches.
pub fn synthetic_source(device: &Device) -> ListSource {
    ListSource::default()
        .with(
            Domain::Noisy,
            Split::Train,
            vec![
                make_batch(&["ab", "c"], &[1.0, 0.5], 1, device),
                make_batch(&["ca", "b a"], &[1.0, 1.0], 2, device),
            ],
        )
        .with(
            Domain::Clean,
            Split::Train,
            vec![make_batch(&["ab", "c"], &[1.0, 1.0], 3, device)],
        )
        .with(
            Domain::Noisy,
            Split::TrainSubset,
            vec![make_batch(&["ab", "c"], &[1.0, 0.5], 4, device)],
        )
        .with(
            Domain::Noisy,
            Split::Validation,
            vec![
                make_batch(&["a b"], &[1.0], 5, device),
                make_batch(&["c a", "bb"], &[1.0, 0.75], 6, device),
            ],
        )
}

/// Small, quiet configuration writing into `output_dir`.
pub fn test_config(output_dir: &std::path::Path) -> AasConfig {
    let mut config = AasConfig::debug_preset();
    config.output_dir = output_dir.to_path_buf();
    config.progress = false;
    config.optim.learning_rate = 1e-2;
    config.controller.lambda_k = 0.1;
    config.schedule.max_iter = 4;
    config.schedule.log_iter = 2;
    config.schedule.save_iter = 2;
    config.schedule.allow_asr_update_iter = 1;
    config.diagnostics.transcript_probability = 0.0;
    config
}

/// Flattened values of every parameter in `vars`, ordered by name.
pub fn snapshot(vars: &VarMap) -> Vec<f32> {
    let data = vars.data().lock().unwrap();
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    names
        .into_iter()
        .flat_map(|name| {
            data[name]
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        })
        .collect()
}
