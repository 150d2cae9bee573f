//! # aas-trainer-rs
//!
//! Adversarial speech enhancement with a jointly adapted recognizer.
//!
//! A generator enhances noisy spectra. A discriminator (an autoencoder
//! scoring realism by reconstruction error) pushes enhanced speech towards
//! clean speech, balanced by a proportional controller. A pretrained CTC
//! recognizer pulls the generator towards intelligible output and is itself
//! fine-tuned after a warm-up.
//!
//! The crate owns the training orchestration: the per-step protocol,
//! gradient scoping, the controller, evaluation and checkpoint retention.
//! Network architectures and the data pipeline are supplied by the caller
//! through [`Network`] and [`BatchSource`].
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a sample configuration
//! aas init aas.yaml --preset default
//!
//! # Validate it
//! aas validate aas.yaml
//!
//! # Which iteration would a resume start from?
//! aas resume-point ./runs/aas
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use aas_trainer_rs::{AasConfig, GreedyDecoder, ModelSet, Network, RecognizerLoader, Trainer};
//! # use aas_trainer_rs::BatchSource;
//!
//! # fn run(
//! #     generator: Box<dyn Network>,
//! #     discriminator: Box<dyn Network>,
//! #     loader: &impl RecognizerLoader,
//! #     source: &mut dyn BatchSource,
//! # ) -> aas_trainer_rs::Result<()> {
//! let config = AasConfig::from_file("aas.yaml")?;
//! let device = aas_trainer_rs::trainer::select_device(&config.device);
//! let models =
//!     ModelSet::from_config(generator, discriminator, loader, &config.checkpoint, &device)?;
//! let decoder = GreedyDecoder::new("_'ABCDEFGHIJKLMNOPQRSTUVWXYZ ");
//!
//! let mut trainer = Trainer::new(config, models)?;
//! trainer.resume()?;
//! trainer.train(source, &decoder)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Presets
//!
//! ```rust
//! use aas_trainer_rs::AasConfig;
//!
//! # fn main() -> aas_trainer_rs::Result<()> {
//! let mut config = AasConfig::from_preset("debug")?;
//! config.schedule.max_iter = 500;
//! config.controller.lambda_k = 0.01;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod ctc;
pub mod data;
pub mod decoder;
pub mod error;
pub mod evaluation;
pub mod gradients;
pub mod masked_loss;
pub mod network;
pub mod optimizer;
pub mod run_log;
pub mod running_stat;
pub mod trainer;

pub use checkpoint::{CheckpointKind, CheckpointManager, CheckpointRecord};
pub use config::AasConfig;
pub use controller::{ControlledWeight, ControllerStep};
pub use data::{Batch, BatchSource, Domain, Split};
pub use decoder::{AcousticDecoder, GreedyDecoder};
pub use error::{AasError, Result};
pub use evaluation::{EvaluationResult, TranscriptProbe};
pub use gradients::UpdateScope;
pub use masked_loss::{masked_l1_loss, MaskedLoss};
pub use network::{
    InferenceGuard, ModelRole, ModelSet, Network, RecognizerLoader, SafetensorsPackage,
};
pub use running_stat::RunningStat;
pub use trainer::{StepReport, Trainer};
