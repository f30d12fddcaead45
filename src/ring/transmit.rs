//! Non-blocking socket sinks
//!
//! [`SocketSink`] is the transmit capability the ring buffer and the fan-out
//! loop need from a consumer socket. Every call must be non-blocking: a full
//! socket answers `WouldBlock` and the caller retries on a later pass.

use std::io::{self, IoSlice};

use tokio::net::TcpStream;

/// Non-blocking byte sink
pub trait SocketSink {
    /// Write as much of `buf` as the socket accepts right now
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Gather-write several slices in one call
    ///
    /// The default writes the first non-empty slice only, which is a valid
    /// partial write.
    fn try_write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match bufs.iter().find(|b| !b.is_empty()) {
            Some(buf) => self.try_write(buf),
            None => Ok(0),
        }
    }

    /// Whether `try_write_vectored` sends straight from the given slices
    fn is_write_vectored(&self) -> bool {
        false
    }
}

impl SocketSink for TcpStream {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }

    fn try_write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        TcpStream::try_write_vectored(self, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        true
    }
}

/// Classify an I/O error as "try again on the next pass"
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
