use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for the periodontal segmentation pipeline.
///
/// Each variant captures the context of its own error domain so callers can
/// decide how to present a failure without parsing strings. Unknown class
/// IDs have no variant; they degrade to the "Unknown" diagnosis label.
#[derive(Error, Debug)]
pub enum PerioSegError {
    #[error("Decode error: {path} could not be read as an image")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Missing weights: no trained parameters found at {path:?}")]
    MissingWeights { path: PathBuf },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PerioSegError>;

impl PerioSegError {
    pub(crate) fn shape_mismatch(
        context: impl Into<String>,
        expected: &[usize],
        actual: &[usize],
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should build
/// `PerioSegError::FileSystem` directly; this is the fallback.
impl From<std::io::Error> for PerioSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert image crate errors to image processing errors.
///
/// Decoding failures are mapped to `Decode` at the call site, where the
/// source name is known.
impl From<image::ImageError> for PerioSegError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
impl From<ort::Error> for PerioSegError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ndarray shape errors to model errors.
///
/// These come out of reshapes and concatenations inside tensor code, where
/// the offending shapes are already validated, so the category is "model".
impl From<ndarray::ShapeError> for PerioSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ndarray_npy::ReadNpzError> for PerioSegError {
    fn from(err: ndarray_npy::ReadNpzError) -> Self {
        Self::Model {
            operation: "weight archive read".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ndarray_npy::WriteNpzError> for PerioSegError {
    fn from(err: ndarray_npy::WriteNpzError) -> Self {
        Self::Model {
            operation: "weight archive write".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<serde_json::Error> for PerioSegError {
    fn from(err: serde_json::Error) -> Self {
        Self::Model {
            operation: "report serialization".to_string(),
            source: Box::new(err),
        }
    }
}
