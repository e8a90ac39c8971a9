//! Error types for the GLBGCN backbone.
//!
//! Every module that produces an error imports its error type from here
//! rather than defining it inline, keeping the hierarchy in one place.
//!
//! ## Hierarchy
//!
//! ```text
//! GcnError (top-level)
//! ├── ConfigError      (construction-time validation / config file loading)
//! └── CheckpointError  (state-dict file I/O and parsing)
//! ```

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// GcnResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used throughout the crate.
pub type GcnResult<T> = Result<T, GcnError>;

// ---------------------------------------------------------------------------
// GcnError: top-level aggregator
// ---------------------------------------------------------------------------

/// Top-level error type for the GLBGCN backbone.
///
/// Construction and forward-pass functions return `GcnResult<T>`. Lower-level
/// helpers in [`crate::config`] and [`crate::checkpoint`] return their own
/// error types which are coerced into `GcnError` via [`From`].
#[derive(Debug, Error)]
pub enum GcnError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A checkpoint could not be read, parsed or written.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// A tensor did not have the shape an operation requires.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Operation that detected the mismatch.
        context: &'static str,
        /// Expected shape (0 marks a free dimension).
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// The input tensor is structurally invalid for the backbone.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An ndarray reshape failed because of the memory layout.
    #[error("Tensor layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),
}

impl GcnError {
    /// Construct a [`GcnError::ShapeMismatch`].
    pub fn shape_mismatch(context: &'static str, expected: Vec<usize>, actual: Vec<usize>) -> Self {
        GcnError::ShapeMismatch { context, expected, actual }
    }

    /// Construct a [`GcnError::InvalidInput`].
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        GcnError::InvalidInput(msg.into())
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating a [`BackboneConfig`], or when
/// a block is constructed with inconsistent hyper-parameters.
///
/// [`BackboneConfig`]: crate::config::BackboneConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read from or written to disk.
    #[error("Cannot access config file `{path}`: {source}")]
    FileAccess {
        /// Path that was being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

/// Errors produced while reading or writing a state-dict file.
///
/// Partial key overlap is *not* an error; it is reported through
/// [`LoadReport`](crate::checkpoint::LoadReport).
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The checkpoint file could not be read or written.
    #[error("I/O error on checkpoint `{path}`: {source}")]
    Io {
        /// Path of the checkpoint.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint file is not a valid serialized state dict.
    #[error("Cannot parse checkpoint `{path}`: {source}")]
    Parse {
        /// Path of the checkpoint.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A tensor record's data length disagrees with its declared shape.
    #[error("Tensor `{name}` declares shape {shape:?} but holds {len} values")]
    CorruptTensor {
        /// Key of the offending tensor.
        name: String,
        /// Declared shape.
        shape: Vec<usize>,
        /// Number of stored values.
        len: usize,
    },
}

impl CheckpointError {
    /// Construct a [`CheckpointError::Io`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io { path: path.into(), source }
    }

    /// Construct a [`CheckpointError::Parse`].
    pub fn parse(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        CheckpointError::Parse { path: path.into(), source }
    }
}
