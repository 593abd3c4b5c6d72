//! Unified error handling for ZeroForge
//!
//! The runtime surfaces a closed set of error kinds; the outer API layer
//! translates these to its own numeric codes. Native-driver failures are
//! mapped to the nearest kind at the call site.

use crate::driver::DriverError;

/// Runtime error kinds.
///
/// This is a closed taxonomy: new failure modes must map onto one of these
/// variants rather than grow the set.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ZeroForgeError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),
    #[error("invalid device pointer: {0}")]
    InvalidDevicePointer(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("launch failure: {0}")]
    LaunchFailure(String),
    #[error("not ready: {0}")]
    NotReady(String),
    #[error("resource busy: {0}")]
    ResourceBusy(String),
    #[error("initialization error: {0}")]
    InitializationError(String),
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Result type used throughout the runtime.
pub type ZfResult<T> = std::result::Result<T, ZeroForgeError>;

impl<T> From<std::sync::PoisonError<T>> for ZeroForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ZeroForgeError::Unknown(format!("lock poisoned: {}", err))
    }
}

impl From<DriverError> for ZeroForgeError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::InvalidArgument(m) => ZeroForgeError::InvalidValue(m),
            DriverError::InvalidHandle(m) => ZeroForgeError::InvalidHandle(m),
            DriverError::OutOfMemory(m) => ZeroForgeError::OutOfMemory(m),
            DriverError::NotReady => ZeroForgeError::NotReady("native handle pending".to_string()),
            DriverError::NotFound(m) => ZeroForgeError::InvalidSymbol(m),
            DriverError::Unsupported(m) => ZeroForgeError::Unimplemented(m),
            DriverError::DeviceLost(m) => ZeroForgeError::Unknown(format!("device lost: {}", m)),
        }
    }
}
