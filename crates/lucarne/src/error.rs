//! Failure taxonomy for the shared-image fast path.
//!
//! None of these are fatal. Every variant means "this frame goes through the
//! fallback path"; the next frame's factory call re-attempts from scratch.

use std::io;

/// Errors from the shared-image lifecycle.
#[derive(Debug)]
pub enum ShmError {
    /// Shared-memory presentation is structurally unavailable on this
    /// connection: extension missing, remote display, or no permission.
    Unavailable,
    /// The kernel segment could not be created or mapped.
    Allocation(io::Error),
    /// The server rejected the attach or the requested pixel layout.
    Binding(String),
    /// A transfer to the target drawable did not complete.
    Transfer(String),
}

impl std::fmt::Display for ShmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "shared-memory presentation unavailable"),
            Self::Allocation(e) => write!(f, "segment allocation failed: {}", e),
            Self::Binding(e) => write!(f, "server binding failed: {}", e),
            Self::Transfer(e) => write!(f, "transfer failed: {}", e),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Allocation(e) => Some(e),
            _ => None,
        }
    }
}
