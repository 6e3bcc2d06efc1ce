//! Unified error types for somgrid.
//!
//! [`SomError`] covers configuration problems, device and shader failures
//! and runtime errors raised while a training run is in flight. It uses the
//! `thiserror` crate for ergonomic error handling.
//!
//! # Example
//!
//! ```rust
//! use somgrid::{ConfigError, SomError};
//!
//! fn check_features(expected: usize, got: usize) -> Result<(), SomError> {
//!     if expected != got {
//!         return Err(SomError::shape_mismatch(&[expected], &[got]));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_features(3, 4).is_err());
//! let err: SomError = ConfigError::EmptyTrainingSet.into();
//! assert!(err.to_string().contains("Configuration error"));
//! ```

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;

/// Device error code attached to runtime failures.
///
/// wgpu does not expose numeric status codes, so failures are classified by
/// the error scope that caught them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    /// Allocation failed on the device.
    OutOfMemory,
    /// The device rejected a command (bad binding, bad dispatch size, ...).
    Validation,
    /// Driver or backend internal error.
    Internal,
    /// A host readback could not map its staging buffer.
    MapFailed,
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceErrorCode::OutOfMemory => "OUT_OF_MEMORY",
            DeviceErrorCode::Validation => "VALIDATION",
            DeviceErrorCode::Internal => "INTERNAL",
            DeviceErrorCode::MapFailed => "MAP_FAILED",
        };
        f.write_str(name)
    }
}

/// Unified error type for somgrid operations.
#[derive(Error, Debug)]
pub enum SomError {
    /// Configuration error, raised before any device interaction.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Shape mismatch between expected and actual data.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Shape received.
        got: Vec<usize>,
    },

    /// A dispatch-plan invariant was violated.
    #[error("Dispatch invariant violated: {0}")]
    Invariant(String),

    /// A kernel or buffer was used in a state that does not allow it.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Runtime failure of a device operation.
    #[error("Device operation '{operation}' failed ({code}): {message}")]
    Device {
        /// Name of the failing operation.
        operation: &'static str,
        /// Classified device error code.
        code: DeviceErrorCode,
        /// Backend diagnostic text.
        message: String,
    },

    /// A training run stopped at `step` because a device operation failed.
    ///
    /// The grid keeps every update made before the failing step.
    #[error("Training aborted at step {step}: {source}")]
    TrainingAborted {
        /// Index of the training vector being processed.
        step: usize,
        /// The underlying failure.
        #[source]
        source: Box<SomError>,
    },

    /// Uncaptured wgpu error.
    #[cfg(feature = "gpu")]
    #[error("GPU device error: {0}")]
    DeviceError(#[from] wgpu::Error),

    /// GPU device request failed.
    #[cfg(feature = "gpu")]
    #[error("Failed to create GPU device: {0}")]
    DeviceRequestFailed(#[from] wgpu::RequestDeviceError),

    /// No suitable GPU adapter was found.
    #[cfg(feature = "gpu")]
    #[error("Failed to find suitable GPU adapter: {0}")]
    AdapterNotFound(String),

    /// GPU hardware doesn't support the limits the grid needs.
    #[cfg(feature = "gpu")]
    #[error("Unsupported GPU limits: {0}")]
    UnsupportedLimits(String),

    /// Kernel program failed to build.
    #[cfg(feature = "gpu")]
    #[error("Shader error in '{entry_point}': {diagnostics}")]
    ShaderError {
        /// Entry point whose module or pipeline failed.
        entry_point: String,
        /// Compiler diagnostics.
        diagnostics: String,
    },

    /// Buffer allocation or transfer failed.
    #[cfg(feature = "gpu")]
    #[error("Buffer operation failed: {0}")]
    BufferError(String),
}

/// Result type alias for somgrid operations.
pub type SomResult<T> = Result<T, SomError>;

impl SomError {
    /// Creates a shape mismatch error.
    pub fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        SomError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Creates an invariant violation error.
    pub fn invariant<S: Into<String>>(msg: S) -> Self {
        SomError::Invariant(msg.into())
    }

    /// Creates a validation error.
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        SomError::Validation(msg.into())
    }

    /// Creates a runtime device error.
    pub fn device<S: Into<String>>(operation: &'static str, code: DeviceErrorCode, msg: S) -> Self {
        SomError::Device {
            operation,
            code,
            message: msg.into(),
        }
    }

    /// Wraps a failure raised while processing training vector `step`.
    pub fn aborted(step: usize, source: SomError) -> Self {
        SomError::TrainingAborted {
            step,
            source: Box::new(source),
        }
    }

    /// Returns the device error code, looking through `TrainingAborted`.
    pub fn device_code(&self) -> Option<DeviceErrorCode> {
        match self {
            SomError::Device { code, .. } => Some(*code),
            SomError::TrainingAborted { source, .. } => source.device_code(),
            _ => None,
        }
    }

    /// Creates an adapter not found error.
    #[cfg(feature = "gpu")]
    pub fn adapter_not_found<S: Into<String>>(msg: S) -> Self {
        SomError::AdapterNotFound(msg.into())
    }

    /// Creates an unsupported limits error.
    #[cfg(feature = "gpu")]
    pub fn unsupported_limits<S: Into<String>>(msg: S) -> Self {
        SomError::UnsupportedLimits(msg.into())
    }

    /// Creates a shader build error.
    #[cfg(feature = "gpu")]
    pub fn shader<E: Into<String>, D: Into<String>>(entry_point: E, diagnostics: D) -> Self {
        SomError::ShaderError {
            entry_point: entry_point.into(),
            diagnostics: diagnostics.into(),
        }
    }

    /// Creates a buffer error.
    #[cfg(feature = "gpu")]
    pub fn buffer<S: Into<String>>(msg: S) -> Self {
        SomError::BufferError(msg.into())
    }
}
