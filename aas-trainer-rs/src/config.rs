//! Configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AasError, Result};

/// Main configuration for an adversarial enhancement run.
///
/// # Example
///
/// ```rust
/// use aas_trainer_rs::AasConfig;
///
/// # fn main() -> aas_trainer_rs::Result<()> {
/// let mut config = AasConfig::from_preset("default")?;
/// config.schedule.max_iter = 20_000;
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AasConfig {
    /// Run directory: log file, checkpoints and manifest live here.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Optimizer hyperparameters (shared by all three models).
    #[serde(default)]
    pub optim: OptimConfig,

    /// Loss weights.
    #[serde(default)]
    pub loss: LossWeights,

    /// Proportional controller parameters.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Iteration schedule.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Samples per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Device placement.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Checkpoint loading.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Evaluation diagnostics.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Show a progress bar while training.
    #[serde(default = "default_true")]
    pub progress: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./logs/run")
}
fn default_batch_size() -> usize {
    16
}
fn default_true() -> bool {
    true
}

/// Adam hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimConfig {
    /// Learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,
    /// First moment decay.
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    /// Second moment decay.
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    /// Keep the running maximum of the second moment (AMSGrad).
    #[serde(default = "default_true")]
    pub amsgrad: bool,
    /// L2 penalty added to the gradient.
    #[serde(default)]
    pub weight_decay: f64,
}

fn default_lr() -> f64 {
    1e-4
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            amsgrad: true,
            weight_decay: 0.0,
        }
    }
}

/// Loss weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossWeights {
    /// Weight on every adversarial realism loss.
    #[serde(default = "default_adversarial_weight")]
    pub adversarial_weight: f64,
    /// Weight on the CTC loss.
    #[serde(default = "default_acoustic_weight")]
    pub acoustic_weight: f64,
}

fn default_adversarial_weight() -> f64 {
    1.0
}
fn default_acoustic_weight() -> f64 {
    1.0
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            adversarial_weight: default_adversarial_weight(),
            acoustic_weight: default_acoustic_weight(),
        }
    }
}

/// Proportional controller parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Target ratio between noisy and clean realism losses.
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Controller gain.
    #[serde(default = "default_lambda_k")]
    pub lambda_k: f64,
    /// Starting weight.
    #[serde(default)]
    pub initial_weight: f64,
}

fn default_gamma() -> f64 {
    1.0
}
fn default_lambda_k() -> f64 {
    0.001
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            gamma: default_gamma(),
            lambda_k: default_lambda_k(),
            initial_weight: 0.0,
        }
    }
}

/// Iteration schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Exclusive upper bound on the iteration counter.
    #[serde(default = "default_max_iter")]
    pub max_iter: u64,
    /// First iteration. `0` on resume means "infer from checkpoints".
    #[serde(default)]
    pub start_iter: u64,
    /// Emit training statistics every N iterations.
    #[serde(default = "default_log_iter")]
    pub log_iter: u64,
    /// Evaluate and checkpoint every N iterations.
    #[serde(default = "default_save_iter")]
    pub save_iter: u64,
    /// Recognizer weights only move once the iteration exceeds this.
    #[serde(default = "default_allow_asr_update_iter")]
    pub allow_asr_update_iter: u64,
}

fn default_max_iter() -> u64 {
    100_000
}
fn default_log_iter() -> u64 {
    100
}
fn default_save_iter() -> u64 {
    1000
}
fn default_allow_asr_update_iter() -> u64 {
    5000
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            start_iter: 0,
            log_iter: default_log_iter(),
            save_iter: default_save_iter(),
            allow_asr_update_iter: default_allow_asr_update_iter(),
        }
    }
}

/// Device placement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Place tensors on a CUDA device when one is available.
    #[serde(default)]
    pub gpu: bool,
    /// CUDA ordinal.
    #[serde(default)]
    pub ordinal: usize,
}

/// Checkpoint loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Run directory to resume from.
    #[serde(default)]
    pub load_path: Option<PathBuf>,
    /// Pretrained recognizer weights.
    #[serde(default)]
    pub recognizer_package: Option<PathBuf>,
}

/// Evaluation diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Probability of printing a decoded transcript during evaluation.
    #[serde(default = "default_transcript_probability")]
    pub transcript_probability: f64,
    /// Seed of the transcript sampler.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_transcript_probability() -> f64 {
    0.001
}
fn default_seed() -> u64 {
    42
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            transcript_probability: default_transcript_probability(),
            seed: default_seed(),
        }
    }
}

impl Default for AasConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            optim: OptimConfig::default(),
            loss: LossWeights::default(),
            controller: ControllerConfig::default(),
            schedule: ScheduleConfig::default(),
            batch_size: default_batch_size(),
            device: DeviceConfig::default(),
            checkpoint: CheckpointConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            progress: true,
        }
    }
}

impl AasConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Write configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a named preset.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown preset.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "default" => Ok(Self::default()),
            "debug" => Ok(Self::debug_preset()),
            _ => Err(AasError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Short schedule with frequent logging and checkpoints.
    #[must_use]
    pub fn debug_preset() -> Self {
        Self {
            output_dir: PathBuf::from("./logs/debug"),
            schedule: ScheduleConfig {
                max_iter: 200,
                start_iter: 0,
                log_iter: 10,
                save_iter: 50,
                allow_asr_update_iter: 100,
            },
            batch_size: 4,
            progress: false,
            ..Self::default()
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(AasError::Config("output_dir is required".into()));
        }

        if self.batch_size == 0 {
            return Err(AasError::Config("batch_size must be > 0".into()));
        }

        if !(self.optim.learning_rate > 0.0) {
            return Err(AasError::Config("optim.learning_rate must be > 0".into()));
        }

        for (name, beta) in [("beta1", self.optim.beta1), ("beta2", self.optim.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(AasError::Config(format!("optim.{name} must be in [0, 1)")));
            }
        }

        if self.optim.weight_decay < 0.0 {
            return Err(AasError::Config("optim.weight_decay must be >= 0".into()));
        }

        if !(0.0..=1.0).contains(&self.controller.initial_weight) {
            return Err(AasError::Config(
                "controller.initial_weight must be in [0, 1]".into(),
            ));
        }

        if !self.controller.gamma.is_finite() || !self.controller.lambda_k.is_finite() {
            return Err(AasError::Config(
                "controller.gamma and controller.lambda_k must be finite".into(),
            ));
        }

        let schedule = &self.schedule;
        if schedule.log_iter == 0 || schedule.save_iter == 0 {
            return Err(AasError::Config(
                "schedule.log_iter and schedule.save_iter must be > 0".into(),
            ));
        }

        if schedule.start_iter >= schedule.max_iter {
            return Err(AasError::Config(format!(
                "schedule.start_iter ({}) must be < schedule.max_iter ({})",
                schedule.start_iter, schedule.max_iter
            )));
        }

        if !(0.0..=1.0).contains(&self.diagnostics.transcript_probability) {
            return Err(AasError::Config(
                "diagnostics.transcript_probability must be in [0, 1]".into(),
            ));
        }

        Ok(())
    }

    /// Path of the append-only run log.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.output_dir.join("log.txt")
    }
}
