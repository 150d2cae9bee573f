//! Error types for aas-trainer-rs.
//!
//! Nothing in the training core retries. Every error propagates to the
//! orchestrator and ends the run, because continuing after a numerical or
//! data-integrity fault would corrupt every later step.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use aas_trainer_rs::{AasConfig, AasError};
//!
//! # fn main() {
//! match AasConfig::from_preset("unknown") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(AasError::Config(msg)) => eprintln!("Configuration error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for aas-trainer-rs operations.
pub type Result<T> = std::result::Result<T, AasError>;

/// Errors that can occur in aas-trainer-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AasError {
    /// Resume state is missing or ambiguous. Never recoverable.
    #[error("startup error: {0}")]
    StartupFatal(String),

    /// A batch or loss input broke a data invariant (empty mask, target
    /// lengths that do not add up, impossible CTC alignment).
    #[error("data invariant violated: {0}")]
    DataInvariant(String),

    /// Checkpoint persistence failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Manifest (de)serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl AasError {
    /// Create a startup error.
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::StartupFatal(msg.into())
    }

    /// Create a data invariant error.
    pub fn data(msg: impl Into<String>) -> Self {
        Self::DataInvariant(msg.into())
    }

    /// Create a checkpoint error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a training error.
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Whether this error must stop the process before any step runs.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self, Self::StartupFatal(_))
    }
}

impl From<indicatif::style::TemplateError> for AasError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        AasError::Template(err.to_string())
    }
}
