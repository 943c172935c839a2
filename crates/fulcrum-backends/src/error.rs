//! Error types for backend operations
//!
//! Recoverable failures (allocation, compilation, malformed tensors) travel as
//! [`BackendError`]. Broken preconditions such as an out-of-range registry
//! index or a buffer bound to the wrong memory policy are programming errors
//! and go through [`fatal!`](crate::fatal) instead.

use std::fmt;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur while allocating, compiling or executing
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Device memory could not be reserved
    #[error("allocation of {requested} bytes failed on {device}: {reason}")]
    AllocationFailed {
        device: String,
        requested: usize,
        reason: String,
    },

    /// Buffer access out of bounds
    #[error("buffer access out of bounds: offset {offset} + size {size} > buffer size {buffer_size}")]
    BufferOutOfBounds {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// The compile oracle rejected a kernel
    #[error("failed to compile kernel {kernel}: {reason}")]
    Compile { kernel: String, reason: String },

    /// Unsupported operation
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Unsupported element type for an operation
    #[error("unsupported type {ty} for {op}")]
    UnsupportedType { op: String, ty: String },

    /// Tensor descriptor is malformed or unbound
    #[error("invalid tensor {name}: {reason}")]
    InvalidTensor { name: String, reason: String },

    /// Execution error
    #[error("execution error: {0}")]
    ExecutionError(String),

    /// Invalid configuration value
    #[error("invalid configuration {key}={value}: {reason}")]
    InvalidConfig {
        key: String,
        value: String,
        reason: String,
    },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Create an execution error
    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }

    /// Create an unsupported type error
    pub fn unsupported_type(op: impl fmt::Display, ty: impl fmt::Display) -> Self {
        Self::UnsupportedType {
            op: op.to_string(),
            ty: ty.to_string(),
        }
    }

    /// Create an invalid tensor error
    pub fn invalid_tensor(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTensor {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a compile error
    pub fn compile(kernel: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Compile {
            kernel: kernel.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an allocation failure
    pub fn allocation(device: impl Into<String>, requested: usize, reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            device: device.into(),
            requested,
            reason: reason.into(),
        }
    }
}

/// Abort on a violated precondition.
///
/// Logs the message at `error` level so the failing operation shows up in
/// collected logs, then panics with the same message.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        let message = ::std::format!($($arg)+);
        $crate::__tracing::error!(target: "fulcrum_backends::fatal", "{}", message);
        panic!("{}", message)
    }};
}

/// `fatal!` unless the condition holds.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BackendError::allocation("GPU0", 1 << 20, "exceeds max buffer size");
        assert_eq!(
            err.to_string(),
            "allocation of 1048576 bytes failed on GPU0: exceeds max buffer size"
        );

        let err = BackendError::BufferOutOfBounds {
            offset: 8,
            size: 16,
            buffer_size: 20,
        };
        assert!(err.to_string().contains("8 + size 16 > buffer size 20"));

        let err = BackendError::unsupported_type("mul_mat", "q4_0");
        assert_eq!(err.to_string(), "unsupported type q4_0 for mul_mat");
    }

    #[test]
    #[should_panic(expected = "index 3 out of range")]
    fn test_fatal_panics() {
        fatal!("index {} out of range", 3);
    }

    #[test]
    fn test_ensure_passes() {
        ensure!(1 + 1 == 2, "arithmetic is broken");
    }
}
