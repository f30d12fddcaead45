//! Error types
//!
//! Crate-wide error enum plus the configuration error kind. Module specific
//! errors (`RegistryError`, `RuntimeError`, `RequestError`) live next to the
//! code that produces them and convert into [`Error`].

use std::fmt;
use std::io;

use crate::registry::RegistryError;
use crate::runtime::RuntimeError;
use crate::server::request::RequestError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Socket or other OS-level failure
    Io(io::Error),
    /// Invalid settings, rejected at creation time
    Config(ConfigError),
    /// Channel resolution or attach failure
    Registry(RegistryError),
    /// Worker runtime failure
    Runtime(RuntimeError),
    /// Malformed client request
    Request(RequestError),
    /// Diagnostics text could not be formatted
    Format(fmt::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Config(e) => write!(f, "Invalid configuration: {}", e),
            Error::Registry(e) => write!(f, "Registry error: {}", e),
            Error::Runtime(e) => write!(f, "Runtime error: {}", e),
            Error::Request(e) => write!(f, "Bad request: {}", e),
            Error::Format(e) => write!(f, "Formatting error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Config(e) => Some(e),
            Error::Registry(e) => Some(e),
            Error::Runtime(e) => Some(e),
            Error::Request(e) => Some(e),
            Error::Format(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<fmt::Error> for Error {
    fn from(e: fmt::Error) -> Self {
        Error::Format(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Error::Registry(e)
    }
}

impl From<RuntimeError> for Error {
    fn from(e: RuntimeError) -> Self {
        Error::Runtime(e)
    }
}

impl From<RequestError> for Error {
    fn from(e: RequestError) -> Self {
        Error::Request(e)
    }
}

/// Settings rejected by validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Precache does not fit into the ring buffer
    PrecacheExceedsRing { precache: usize, ring_size: usize },
    /// Minimum send block can never be satisfied by one send
    SendBlockExceedsSendBuffer {
        min_send_block: usize,
        socket_send_buf: usize,
    },
    /// Ring buffer cannot hold two maximum-size datagrams
    RingTooSmall { ring_size: usize, minimum: usize },
    /// Worker count must be at least one
    NoWorkers,
    /// Periodic sweep interval must be non-zero
    ZeroTickInterval,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::PrecacheExceedsRing {
                precache,
                ring_size,
            } => write!(
                f,
                "precache ({} bytes) is larger than ring size ({} bytes)",
                precache, ring_size
            ),
            ConfigError::SendBlockExceedsSendBuffer {
                min_send_block,
                socket_send_buf,
            } => write!(
                f,
                "minimum send block ({} bytes) is larger than socket send buffer ({} bytes)",
                min_send_block, socket_send_buf
            ),
            ConfigError::RingTooSmall { ring_size, minimum } => write!(
                f,
                "ring size ({} bytes) is below the minimum of {} bytes",
                ring_size, minimum
            ),
            ConfigError::NoWorkers => write!(f, "worker count must be at least 1"),
            ConfigError::ZeroTickInterval => write!(f, "tick interval must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
