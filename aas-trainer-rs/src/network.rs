//! The three trained networks, treated as opaque differentiable functions.
//!
//! Architectures live outside this crate. A [`Network`] only has to expose a
//! forward pass, its parameter store and a train/inference switch.

use std::fmt;
use std::ops::Deref;
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::config::CheckpointConfig;
use crate::error::{AasError, Result};

/// Differentiable model with named parameters.
pub trait Network {
    /// Run the model. Generator and discriminator map `[N, F, T]` to
    /// `[N, F, T]`; the recognizer maps `[N, F, T]` to `[N, T', V]` logits.
    ///
    /// # Errors
    ///
    /// Returns an error if any tensor op fails.
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Parameter store.
    fn vars(&self) -> &VarMap;

    /// Switch between training and inference behaviour (normalization
    /// statistics, dropout). Stateless networks can ignore it.
    fn set_training(&mut self, training: bool);

    /// Whether the network is in training mode.
    fn is_training(&self) -> bool;

    /// Total number of scalar parameters.
    fn parameter_count(&self) -> usize {
        self.vars().all_vars().iter().map(|v| v.elem_count()).sum()
    }
}

/// Which of the three trained models a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    /// Speech enhancement network.
    Generator,
    /// Realism autoencoder.
    Discriminator,
    /// Pretrained acoustic model.
    Recognizer,
}

impl ModelRole {
    /// All roles, in update order.
    pub const ALL: [ModelRole; 3] = [
        ModelRole::Generator,
        ModelRole::Discriminator,
        ModelRole::Recognizer,
    ];

    /// Lowercase name used in file names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Generator => "generator",
            ModelRole::Discriminator => "discriminator",
            ModelRole::Recognizer => "recognizer",
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generator, discriminator and recognizer of one run.
pub struct ModelSet {
    /// Speech enhancement network.
    pub generator: Box<dyn Network>,
    /// Realism autoencoder.
    pub discriminator: Box<dyn Network>,
    /// Pretrained acoustic model, fine-tuned after the warm-up.
    pub recognizer: Box<dyn Network>,
}

impl ModelSet {
    /// Bundle three networks.
    pub fn new(
        generator: Box<dyn Network>,
        discriminator: Box<dyn Network>,
        recognizer: Box<dyn Network>,
    ) -> Self {
        Self {
            generator,
            discriminator,
            recognizer,
        }
    }

    /// Bundle generator and discriminator with a recognizer loaded from a
    /// pretrained package.
    ///
    /// # Errors
    ///
    /// Returns an error if the package cannot be loaded.
    pub fn with_pretrained_recognizer<L: RecognizerLoader>(
        generator: Box<dyn Network>,
        discriminator: Box<dyn Network>,
        loader: &L,
        package: &Path,
        device: &Device,
    ) -> Result<Self> {
        tracing::info!("Loading pretrained recognizer from {}", package.display());
        let recognizer = loader.load_from_package(package, device)?;
        Ok(Self::new(generator, discriminator, recognizer))
    }

    /// Bundle generator and discriminator with the recognizer package named
    /// by `checkpoint.recognizer_package`.
    ///
    /// # Errors
    ///
    /// Returns [`AasError::StartupFatal`] if no package is configured, or the
    /// loader's error.
    pub fn from_config<L: RecognizerLoader>(
        generator: Box<dyn Network>,
        discriminator: Box<dyn Network>,
        loader: &L,
        config: &CheckpointConfig,
        device: &Device,
    ) -> Result<Self> {
        let package = config
            .recognizer_package
            .as_deref()
            .ok_or_else(|| AasError::startup("checkpoint.recognizer_package is not set"))?;
        Self::with_pretrained_recognizer(generator, discriminator, loader, package, device)
    }

    /// Network for a role.
    pub fn get(&self, role: ModelRole) -> &dyn Network {
        match role {
            ModelRole::Generator => self.generator.as_ref(),
            ModelRole::Discriminator => self.discriminator.as_ref(),
            ModelRole::Recognizer => self.recognizer.as_ref(),
        }
    }

    /// Parameter store for a role.
    pub fn vars(&self, role: ModelRole) -> &VarMap {
        self.get(role).vars()
    }
}

/// Puts a network in inference mode and restores training mode on drop,
/// including on early return through `?`.
pub struct InferenceGuard<'a> {
    network: &'a mut (dyn Network + 'a),
    was_training: bool,
}

impl<'a> InferenceGuard<'a> {
    /// Switch `network` to inference mode for the guard's lifetime.
    pub fn new(network: &'a mut (dyn Network + 'a)) -> Self {
        let was_training = network.is_training();
        network.set_training(false);
        Self {
            network,
            was_training,
        }
    }
}

impl<'a> Deref for InferenceGuard<'a> {
    type Target = dyn Network + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.network
    }
}

impl Drop for InferenceGuard<'_> {
    fn drop(&mut self) {
        self.network.set_training(self.was_training);
    }
}

/// Loads an already-trained recognizer whose weights this crate fine-tunes.
pub trait RecognizerLoader {
    /// Build the recognizer and fill its parameters from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the package is missing or incompatible.
    fn load_from_package(&self, path: &Path, device: &Device) -> Result<Box<dyn Network>>;
}

/// Recognizer package stored as a safetensors file of named parameters.
///
/// The builder creates the network with fresh parameters; every parameter is
/// then overwritten from the file.
pub struct SafetensorsPackage<F> {
    build: F,
}

impl<F> SafetensorsPackage<F>
where
    F: Fn(&Device) -> Result<Box<dyn Network>>,
{
    /// Create a loader from a network builder.
    pub fn new(build: F) -> Self {
        Self { build }
    }
}

impl<F> RecognizerLoader for SafetensorsPackage<F>
where
    F: Fn(&Device) -> Result<Box<dyn Network>>,
{
    fn load_from_package(&self, path: &Path, device: &Device) -> Result<Box<dyn Network>> {
        if !path.exists() {
            return Err(AasError::startup(format!(
                "recognizer package not found: {}",
                path.display()
            )));
        }
        let network = (self.build)(device)?;
        load_vars(network.vars(), path, device)?;
        tracing::info!(
            "Loaded recognizer with {} parameters",
            network.parameter_count()
        );
        Ok(network)
    }
}

/// Overwrite every variable in `vars` with the tensor of the same name from
/// a safetensors file.
///
/// # Errors
///
/// Returns [`AasError::Checkpoint`] if a variable is missing from the file or
/// has a different shape.
pub fn load_vars(vars: &VarMap, path: &Path, device: &Device) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, device).map_err(|e| {
        AasError::checkpoint(format!("failed to read {}: {e}", path.display()))
    })?;

    let data = vars
        .data()
        .lock()
        .map_err(|_| AasError::training("parameter store lock poisoned"))?;

    for (name, var) in data.iter() {
        let tensor = tensors.get(name).ok_or_else(|| {
            AasError::checkpoint(format!(
                "{} has no tensor named {name}",
                path.display()
            ))
        })?;
        if tensor.dims() != var.dims() {
            return Err(AasError::checkpoint(format!(
                "{name}: stored shape {:?} does not match parameter shape {:?}",
                tensor.dims(),
                var.dims()
            )));
        }
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }

    Ok(())
}
