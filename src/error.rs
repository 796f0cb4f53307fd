//! Error types for the inference core
//!
//! One crate-wide error enum covers every failure class:
//!
//! - Configuration errors surface synchronously at session start
//! - Format errors surface at weight load time
//! - Shape mismatches are internal contract violations (programmer error)
//! - Capacity and context-limit errors are recoverable by reset/truncation
//!
//! Timeout and cancellation are *not* errors: they are terminal
//! [`FinishReason`](crate::generate::FinishReason) states of the decode
//! state machine, so streaming callers never need exception handling to
//! distinguish a normal stop from a failure.

use thiserror::Error;

/// Result type alias for inferir operations
pub type Result<T> = std::result::Result<T, InferirError>;

/// Errors that can occur in the inference core
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferirError {
    /// Tensor shape is invalid (empty, zero dimension, rank disagreement)
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// What was wrong with the shape
        reason: String,
    },

    /// Data length does not match the declared shape
    #[error("Data size {data_size} does not match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Actual number of elements provided
        data_size: usize,
        /// Declared shape
        shape: Vec<usize>,
        /// Element count implied by the shape
        expected: usize,
    },

    /// Malformed quantized input detected at load time
    #[error("Format error: {reason}")]
    FormatError {
        /// Description of the malformation
        reason: String,
    },

    /// Generation options failed validation at session start
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Which option was rejected and why
        reason: String,
    },

    /// A named quantization scheme exists but is not supported
    #[error("Unsupported quantization scheme: {name}")]
    UnsupportedQuantization {
        /// The scheme name as given by the weight source
        name: String,
    },

    /// Layer index outside the configured layer count
    #[error("Invalid layer {layer} (model has {num_layers} layers)")]
    InvalidLayer {
        /// The out-of-range layer index
        layer: usize,
        /// Configured number of layers
        num_layers: usize,
    },

    /// KV-cache append past its pre-allocated capacity
    #[error("KV-cache capacity {capacity} exceeded")]
    CapacityExceeded {
        /// The fixed capacity set at session creation
        capacity: usize,
    },

    /// Sequence grew past the configured maximum context length
    #[error("Context length {length} exceeds maximum {max}")]
    ContextLimitExceeded {
        /// Requested sequence length
        length: usize,
        /// Configured maximum
        max: usize,
    },

    /// Weight source has no tensor under the requested name
    #[error("Missing tensor: {name}")]
    MissingTensor {
        /// The tensor name requested by the model loader
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InferirError::InvalidShape {
            reason: "empty".to_string(),
        };
        assert!(err.to_string().contains("empty"));

        let err = InferirError::CapacityExceeded { capacity: 128 };
        assert!(err.to_string().contains("128"));

        let err = InferirError::UnsupportedQuantization {
            name: "q3_k_xs".to_string(),
        };
        assert!(err.to_string().contains("q3_k_xs"));
    }

    #[test]
    fn test_error_equality() {
        let a = InferirError::CapacityExceeded { capacity: 8 };
        let b = InferirError::CapacityExceeded { capacity: 8 };
        assert_eq!(a, b);

        let c = InferirError::CapacityExceeded { capacity: 9 };
        assert_ne!(a, c);
    }

    #[test]
    fn test_context_limit_fields() {
        let err = InferirError::ContextLimitExceeded {
            length: 2049,
            max: 2048,
        };
        let msg = err.to_string();
        assert!(msg.contains("2049"));
        assert!(msg.contains("2048"));
    }
}
