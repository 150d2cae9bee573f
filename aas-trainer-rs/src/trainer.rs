//! Adversarial training orchestrator.
//!
//! One [`Trainer::train_step`] runs the fixed protocol:
//!
//! 1. fresh gradient accumulators
//! 2. noisy batch through the generator
//! 3. generator adversarial loss (generator gradients only)
//! 4. discriminator loss on the detached enhanced output, scaled by `-k`
//! 5. CTC loss through recognizer and generator
//! 6. discriminator loss on a clean batch
//! 7. generator and discriminator updates; recognizer update only after the
//!    warm-up
//! 8. controller update
//!
//! [`Trainer::train`] adds the log boundary every `log_iter` completed steps
//! and the evaluation/checkpoint boundary every `save_iter` completed steps.

use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointKind, CheckpointManager};
use crate::config::{AasConfig, DeviceConfig};
use crate::controller::ControlledWeight;
use crate::ctc::{ctc_loss, BLANK};
use crate::data::{BatchSource, Domain, Split};
use crate::decoder::AcousticDecoder;
use crate::error::Result;
use crate::evaluation::{evaluate, scalar, EvaluationResult, TranscriptProbe};
use crate::gradients::{StepGradients, UpdateScope};
use crate::masked_loss::masked_l1_loss;
use crate::network::{ModelRole, ModelSet};
use crate::optimizer::Adam;
use crate::run_log::RunLog;
use crate::running_stat::RunningStat;

/// Losses and diagnostics of one training step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Loop index of the step.
    pub iteration: u64,
    /// Weighted CTC loss per utterance.
    pub ctc_loss: f64,
    /// Weighted realism loss of the enhanced batch, generator side.
    pub generator_adversarial_loss: f64,
    /// Discriminator loss on the detached enhanced batch, including `-k`.
    pub discriminator_adversarial_loss: f64,
    /// Weighted realism loss of the clean batch.
    pub clean_adversarial_loss: f64,
    /// Controller weight after this step.
    pub weight: f64,
    /// Convergence measure after this step.
    pub convergence: f64,
    /// Generator gradient norm after the adversarial sub-step.
    pub grad_norm_adversarial: f32,
    /// Generator gradient norm after the CTC sub-step.
    pub grad_norm_combined: f32,
    /// Whether the recognizer's parameters were updated.
    pub recognizer_updated: bool,
}

/// Evaluation results of one save boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SaveReport {
    /// Completed steps at the boundary.
    pub iteration: u64,
    /// Training subset metrics.
    pub train_subset: EvaluationResult,
    /// Validation metrics.
    pub validation: EvaluationResult,
    /// Whether this boundary became the new best.
    pub promoted: bool,
}

struct Optimizers {
    generator: Adam,
    discriminator: Adam,
    recognizer: Adam,
}

/// Training orchestrator for generator, discriminator and recognizer.
///
/// # Example
///
/// ```no_run
/// use aas_trainer_rs::{AasConfig, GreedyDecoder, ModelSet, Trainer};
/// # use aas_trainer_rs::BatchSource;
///
/// # fn run(models: ModelSet, source: &mut dyn BatchSource) -> aas_trainer_rs::Result<()> {
/// let config = AasConfig::from_file("aas.yaml")?;
/// let decoder = GreedyDecoder::new("_'ABCDEFGHIJKLMNOPQRSTUVWXYZ ");
///
/// let mut trainer = Trainer::new(config, models)?;
/// trainer.resume()?;
/// trainer.train(source, &decoder)?;
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: AasConfig,
    device: Device,
    models: ModelSet,
    optimizers: Optimizers,
    controller: ControlledWeight,
    checkpoints: CheckpointManager,
    run_log: RunLog,
    probe: TranscriptProbe,
    ctc_window: RunningStat,
    best_wer: f64,
    start_iter: u64,
    history: Vec<StepReport>,
    saves: Vec<SaveReport>,
}

impl Trainer {
    /// Create a trainer. The output directory is created and the run log
    /// opened; no model state is loaded yet (see [`Trainer::resume`]).
    ///
    /// If the output directory already holds a best snapshot, its stored
    /// validation WER is the bar a new boundary has to beat.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the output
    /// directory cannot be created.
    pub fn new(config: AasConfig, models: ModelSet) -> Result<Self> {
        config.validate()?;

        let device = select_device(&config.device);
        let checkpoints = CheckpointManager::open(&config.output_dir)?;
        let run_log = RunLog::open(config.log_path());
        let best_wer = checkpoints
            .best_word_error_rate(ModelRole::Generator)
            .unwrap_or(f64::INFINITY);
        if best_wer.is_finite() {
            tracing::info!(
                "Existing best validation WER in {}: {:.7}",
                config.output_dir.display(),
                best_wer * 100.0
            );
        }

        tracing::info!(
            "Parameters: generator {}, discriminator {}, recognizer {}",
            models.generator.parameter_count(),
            models.discriminator.parameter_count(),
            models.recognizer.parameter_count()
        );

        Ok(Self {
            optimizers: Optimizers {
                generator: Adam::new(&config.optim),
                discriminator: Adam::new(&config.optim),
                recognizer: Adam::new(&config.optim),
            },
            controller: ControlledWeight::from_config(&config.controller),
            probe: TranscriptProbe::from_config(&config.diagnostics),
            start_iter: config.schedule.start_iter,
            config,
            device,
            models,
            checkpoints,
            run_log,
            ctc_window: RunningStat::default(),
            best_wer,
            history: Vec::new(),
            saves: Vec::new(),
        })
    }

    /// Restore generator (and recognizer, when available) from the best
    /// snapshot under `checkpoint.load_path`. Without a load path the run
    /// starts at `schedule.start_iter` with the networks as given.
    ///
    /// Returns the iteration training will start from.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AasError::StartupFatal`] if the load path has no
    /// manifest, no generator best snapshot, or the start iteration cannot
    /// be resolved to a positive value.
    pub fn resume(&mut self) -> Result<u64> {
        let Some(load_path) = self.config.checkpoint.load_path.clone() else {
            tracing::info!("No checkpoint to load; starting at iteration {}", self.start_iter);
            return Ok(self.start_iter);
        };

        let source = CheckpointManager::open_existing(&load_path)?;
        let iteration = source.resume_iteration(self.config.schedule.start_iter)?;

        source.load_best(
            ModelRole::Generator,
            iteration,
            self.models.vars(ModelRole::Generator),
            &self.device,
        )?;
        if source.best_at(ModelRole::Recognizer, iteration).is_some() {
            source.load_best(
                ModelRole::Recognizer,
                iteration,
                self.models.vars(ModelRole::Recognizer),
                &self.device,
            )?;
        }

        if iteration >= self.config.schedule.max_iter {
            tracing::warn!(
                "Resume iteration {} is not below max_iter {}; nothing left to train",
                iteration,
                self.config.schedule.max_iter
            );
        }

        self.start_iter = iteration;
        self.run_log.line(&format!(
            "Resumed from {} at iteration {}",
            load_path.display(),
            iteration
        ));
        Ok(iteration)
    }

    /// Run from the start iteration to `schedule.max_iter`.
    ///
    /// # Errors
    ///
    /// Any step, evaluation or checkpoint error ends the run.
    pub fn train(
        &mut self,
        source: &mut dyn BatchSource,
        decoder: &dyn AcousticDecoder,
    ) -> Result<()> {
        let schedule = self.config.schedule.clone();
        let total = schedule.max_iter.saturating_sub(self.start_iter);

        tracing::info!("Starting adversarial training");
        tracing::info!("  Iterations: {}..{}", self.start_iter, schedule.max_iter);
        tracing::info!("  Batch size: {}", self.config.batch_size);
        tracing::info!(
            "  Recognizer updates after iteration {}",
            schedule.allow_asr_update_iter
        );

        let pb = if self.config.progress {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] \
                         {pos:>7}/{len:7} {msg}",
                    )?
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        for iteration in self.start_iter..schedule.max_iter {
            let report = self.train_step(iteration, source)?;
            self.history.push(report);

            pb.set_message(format!("ctc {:.4} k {:.4}", report.ctc_loss, report.weight));
            pb.inc(1);

            let completed = iteration + 1;
            if completed % schedule.log_iter == 0 {
                self.log_boundary(iteration, &report);
            }
            if completed % schedule.save_iter == 0 {
                self.save_boundary(completed, source, decoder)?;
            }
        }

        pb.finish_with_message("Training complete");
        Ok(())
    }

    /// Run one step of the training protocol at loop index `iteration`.
    ///
    /// # Errors
    ///
    /// Returns an error if a batch is invalid or any tensor op fails. The
    /// models may have been partially updated in that case.
    pub fn train_step(
        &mut self,
        iteration: u64,
        source: &mut dyn BatchSource,
    ) -> Result<StepReport> {
        let adv_weight = self.config.loss.adversarial_weight;
        let acoustic_weight = self.config.loss.acoustic_weight;
        let k = self.controller.weight();

        let mut grads = StepGradients::default();

        let noisy = source.next_batch(Domain::Noisy, Split::Train)?;
        let n = noisy.batch_size();
        let enhanced = self.models.generator.forward(&noisy.features)?;

        // Generator adversarial sub-step.
        let realism = self.models.discriminator.forward(&enhanced)?;
        let adv_g = masked_l1_loss(&realism, &enhanced, &noisy.mask)?.scaled(adv_weight)?;
        let adv_g_value = scalar(&adv_g)?;
        grads.absorb(UpdateScope::GeneratorOnly, &adv_g.backward()?, &self.models)?;
        let grad_norm_adversarial = grads.generator.norm()?;

        // Discriminator on the detached enhanced output.
        let detached = enhanced.detach();
        let realism = self.models.discriminator.forward(&detached)?;
        let adv_d = masked_l1_loss(&realism, &detached, &noisy.mask)?.scaled(-k * adv_weight)?;
        let adv_d_value = scalar(&adv_d)?;
        grads.absorb(UpdateScope::DiscriminatorOnly, &adv_d.backward()?, &self.models)?;

        // Recognition: [N, T', V] -> [T', N, V].
        let scores = self.models.recognizer.forward(&enhanced)?.transpose(0, 1)?;
        let lengths = noisy.output_lengths(scores.dim(0)?);
        let ctc = ctc_loss(&scores, &noisy.targets, &lengths, &noisy.target_lengths, BLANK)?;
        let ctc = (ctc * (acoustic_weight / n as f64))?;
        let ctc_value = scalar(&ctc)?;
        grads.absorb(UpdateScope::GeneratorAndRecognizer, &ctc.backward()?, &self.models)?;
        let grad_norm_combined = grads.generator.norm()?;

        // Clean batch, discriminator only.
        let clean = source.next_batch(Domain::Clean, Split::Train)?;
        let realism = self.models.discriminator.forward(&clean.features)?;
        let adv_c = masked_l1_loss(&realism, &clean.features, &clean.mask)?.scaled(adv_weight)?;
        let adv_c_value = scalar(&adv_c)?;
        grads.absorb(UpdateScope::DiscriminatorOnly, &adv_c.backward()?, &self.models)?;

        self.optimizers
            .generator
            .step(self.models.vars(ModelRole::Generator), &grads.generator)?;
        self.optimizers
            .discriminator
            .step(self.models.vars(ModelRole::Discriminator), &grads.discriminator)?;
        let recognizer_updated = iteration > self.config.schedule.allow_asr_update_iter;
        if recognizer_updated {
            self.optimizers
                .recognizer
                .step(self.models.vars(ModelRole::Recognizer), &grads.recognizer)?;
        }

        let control = self.controller.update(adv_c_value, adv_g_value);
        self.ctc_window = self.ctc_window.update(ctc_value, n as f64);

        Ok(StepReport {
            iteration,
            ctc_loss: ctc_value,
            generator_adversarial_loss: adv_g_value,
            discriminator_adversarial_loss: adv_d_value,
            clean_adversarial_loss: adv_c_value,
            weight: control.weight,
            convergence: control.convergence,
            grad_norm_adversarial,
            grad_norm_combined,
            recognizer_updated,
        })
    }

    fn log_boundary(&mut self, iteration: u64, report: &StepReport) {
        let max_iter = self.config.schedule.max_iter;
        self.run_log.line(&format!(
            "[{iteration}/{max_iter}] (train) CTC: {:.7}, ADV_cl: {:.7}, ADV_ny: {:.7}",
            self.ctc_window.avg(),
            report.clean_adversarial_loss,
            report.generator_adversarial_loss
        ));
        self.run_log.line(&format!(
            "[{iteration}/{max_iter}] (train) conv_measure: {:.4}, kt: {:.4}",
            report.convergence, report.weight
        ));
        self.run_log.line(&format!(
            "[{iteration}/{max_iter}] (train) gradient norm, adv: {:.4}, adv + ctc: {:.4}",
            report.grad_norm_adversarial, report.grad_norm_combined
        ));
        self.ctc_window = RunningStat::default();
    }

    /// Evaluate both finite splits, save latest snapshots and promote them
    /// when validation WER improves.
    fn save_boundary(
        &mut self,
        completed: u64,
        source: &mut dyn BatchSource,
        decoder: &dyn AcousticDecoder,
    ) -> Result<()> {
        let max_iter = self.config.schedule.max_iter;

        let train_subset = evaluate(
            &mut self.models,
            source,
            Split::TrainSubset,
            decoder,
            &self.config.loss,
            &mut self.probe,
        )?;
        self.log_evaluation(completed, max_iter, &train_subset);

        let validation = evaluate(
            &mut self.models,
            source,
            Split::Validation,
            decoder,
            &self.config.loss,
            &mut self.probe,
        )?;
        self.log_evaluation(completed, max_iter, &validation);

        for role in [ModelRole::Generator, ModelRole::Recognizer] {
            self.checkpoints
                .save_latest(role, completed, self.models.vars(role))?;
        }

        let promoted = validation.word_error_rate < self.best_wer;
        if promoted {
            self.best_wer = validation.word_error_rate;
            for role in [ModelRole::Generator, ModelRole::Recognizer] {
                self.checkpoints
                    .promote_to_best(role, completed, validation.word_error_rate)?;
            }
            self.run_log.line(&format!(
                "[{completed}/{max_iter}] new best validation WER {:.7}",
                validation.word_error_rate * 100.0
            ));
        }

        self.saves.push(SaveReport {
            iteration: completed,
            train_subset,
            validation,
            promoted,
        });
        Ok(())
    }

    fn log_evaluation(&mut self, completed: u64, max_iter: u64, result: &EvaluationResult) {
        self.run_log.line(&format!(
            "[{completed}/{max_iter}] ({}) CTC: {:.7}, ADV: {:.7}, WER: {:.7}, CER: {:.7}",
            result.split.label(),
            result.ctc_loss,
            result.adversarial_loss,
            result.word_error_rate * 100.0,
            result.char_error_rate * 100.0
        ));
    }

    /// Iteration the next [`Trainer::train`] call starts from.
    pub fn start_iteration(&self) -> u64 {
        self.start_iter
    }

    /// Current controller state.
    pub fn controller(&self) -> &ControlledWeight {
        &self.controller
    }

    /// The trained networks.
    pub fn models(&self) -> &ModelSet {
        &self.models
    }

    /// Checkpoint manager of the output directory.
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Reports of every step run so far.
    pub fn history(&self) -> &[StepReport] {
        &self.history
    }

    /// Reports of every save boundary so far.
    pub fn saves(&self) -> &[SaveReport] {
        &self.saves
    }

    /// Best validation WER of the output directory: seeded from its best
    /// snapshot, then lowered by every promotion of this run.
    pub fn best_word_error_rate(&self) -> Option<f64> {
        self.best_wer.is_finite().then_some(self.best_wer)
    }

    /// Best snapshot iteration of the generator in the output directory.
    pub fn best_iteration(&self) -> Option<u64> {
        self.checkpoints
            .record(ModelRole::Generator, CheckpointKind::Best)
            .map(|r| r.iteration)
    }

    /// Device used for checkpoint restores.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Pick the compute device. GPU placement needs the `cuda` feature; any
/// failure falls back to the CPU with a warning.
pub fn select_device(config: &DeviceConfig) -> Device {
    if !config.gpu {
        tracing::info!("Training device: CPU");
        return Device::Cpu;
    }
    if !cfg!(feature = "cuda") {
        tracing::warn!("GPU requested but the cuda feature is disabled; using CPU");
        return Device::Cpu;
    }
    match Device::cuda_if_available(config.ordinal) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Training device: CUDA (device {})", config.ordinal);
            device
        }
        Ok(_) => {
            tracing::warn!("CUDA not available; falling back to CPU");
            Device::Cpu
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU");
            Device::Cpu
        }
    }
}
