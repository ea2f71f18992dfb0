use std::fmt;

/// Result type for poolnet operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Main error type for the pooling core
///
/// Every variant is fatal for the training step that produced it. Nothing in
/// this crate retries or falls back to another compute path.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolError {
    /// Invalid layer configuration (unsupported mode, shape mismatch, bad geometry)
    Configuration(String),

    /// A device primitive, allocation or transfer failed
    DeviceFailure {
        operation: String,
        reason: String,
    },

    /// Accelerated mode was requested but no device backend is available
    BackendUnavailable(String),

    /// Invalid dimensions for operations
    DimensionMismatch {
        expected: String,
        actual: String,
    },

    /// Invalid parameter value
    InvalidParameter {
        name: String,
        reason: String,
    },

    /// Operation is not allowed in the layer's current state
    InvalidState {
        operation: String,
        state: String,
    },

    /// IO errors (configuration files)
    IoError(String),

    /// Serialization/deserialization errors
    SerializationError(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            PoolError::DeviceFailure { operation, reason } => {
                write!(f, "Device operation '{}' failed: {}", operation, reason)
            }
            PoolError::BackendUnavailable(msg) => write!(f, "Device backend unavailable: {}", msg),
            PoolError::DimensionMismatch { expected, actual } => {
                write!(f, "Dimension mismatch: expected {}, got {}", expected, actual)
            }
            PoolError::InvalidParameter { name, reason } => {
                write!(f, "Invalid parameter '{}': {}", name, reason)
            }
            PoolError::InvalidState { operation, state } => {
                write!(f, "Cannot {} while layer is {}", operation, state)
            }
            PoolError::IoError(msg) => write!(f, "IO error: {}", msg),
            PoolError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for PoolError {}

// Conversion from std::io::Error
impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::IoError(err.to_string())
    }
}

// Conversion from serde_json::Error
impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        PoolError::SerializationError(err.to_string())
    }
}

// Conversion from ndarray::ShapeError
impl From<ndarray::ShapeError> for PoolError {
    fn from(err: ndarray::ShapeError) -> Self {
        PoolError::DimensionMismatch {
            expected: "a compatible array shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(feature = "gpu")]
impl From<ocl::Error> for PoolError {
    fn from(err: ocl::Error) -> Self {
        PoolError::DeviceFailure {
            operation: "opencl".to_string(),
            reason: err.to_string(),
        }
    }
}

// Helper functions for common error patterns
impl PoolError {
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        PoolError::Configuration(msg.into())
    }

    pub fn device_failure<S: Into<String>, R: fmt::Display>(operation: S, reason: R) -> Self {
        PoolError::DeviceFailure {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn dimension_mismatch<S: Into<String>>(expected: S, actual: S) -> Self {
        PoolError::DimensionMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn invalid_parameter<S: Into<String>>(name: S, reason: S) -> Self {
        PoolError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_state<S: Into<String>, T: fmt::Display>(operation: S, state: T) -> Self {
        PoolError::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Whether this error belongs to the configuration class
    pub fn is_configuration(&self) -> bool {
        matches!(self, PoolError::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = PoolError::configuration("no CPU implementation for average_no_pad");
        assert_eq!(
            err.to_string(),
            "Configuration error: no CPU implementation for average_no_pad"
        );
        assert!(err.is_configuration());

        let err = PoolError::device_failure("pooling_forward", "queue lost");
        assert_eq!(err.to_string(), "Device operation 'pooling_forward' failed: queue lost");
        assert!(!err.is_configuration());

        let err = PoolError::invalid_state("backward", "ready");
        assert_eq!(err.to_string(), "Cannot backward while layer is ready");
    }

    #[test]
    fn test_from_json_error() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: PoolError = parse.unwrap_err().into();
        assert!(matches!(err, PoolError::SerializationError(_)));
    }
}
