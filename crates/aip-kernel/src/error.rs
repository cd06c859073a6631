//! Kernel-specific error types.

use aip_types::error::AipError;
use thiserror::Error;

/// Kernel error type wrapping AipError with kernel-specific context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped AipError.
    #[error(transparent)]
    Aip(#[from] AipError),

    /// A host or hub failed to come up.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
