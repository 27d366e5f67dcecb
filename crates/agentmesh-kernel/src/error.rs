//! Kernel-specific error types.

use agentmesh_types::error::MeshError;
use thiserror::Error;

/// Kernel error type wrapping MeshError with lifecycle context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped MeshError.
    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// The component was started twice.
    #[error("Already running: {0}")]
    AlreadyRunning(&'static str),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
