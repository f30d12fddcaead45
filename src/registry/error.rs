//! Registry error types
//!
//! Error types for channel resolution and client attach. These travel back to
//! the caller as ordinary message payloads, never as panics across workers.

use std::io;

use super::source::ChannelKey;

/// Error type for registry operations
#[derive(Debug)]
pub enum RegistryError {
    /// Source socket could not be created or bound
    Bind(ChannelKey, io::Error),
    /// Multicast group could not be joined
    Join(ChannelKey, io::Error),
    /// Consumer socket could not be adopted by the owning worker
    Socket(io::Error),
    /// Interface name or index does not exist
    InterfaceNotFound(String),
    /// Owning worker is not running
    WorkerUnavailable(usize),
    /// Registry was destroyed
    Closed,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Bind(key, e) => write!(f, "Failed to bind source for {}: {}", key, e),
            RegistryError::Join(key, e) => {
                write!(f, "Failed to join multicast group for {}: {}", key, e)
            }
            RegistryError::Socket(e) => write!(f, "Failed to adopt client socket: {}", e),
            RegistryError::InterfaceNotFound(name) => write!(f, "Interface not found: {}", name),
            RegistryError::WorkerUnavailable(id) => write!(f, "Worker {} is not running", id),
            RegistryError::Closed => write!(f, "Registry is closed"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Bind(_, e) | RegistryError::Join(_, e) | RegistryError::Socket(e) => {
                Some(e)
            }
            _ => None,
        }
    }
}
