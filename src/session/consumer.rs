//! Attached stream consumer

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use crate::ring::{ReadCursor, SocketSink};

/// Minimal response for clients that cannot be served
pub const SERVICE_UNAVAILABLE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Who is on the other end of a consumer socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// TCP peer address
    pub peer: SocketAddr,
    /// Address reported by a proxy (`X-Real-IP` / `X-Forwarded-For`)
    pub real_addr: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            real_addr: None,
            user_agent: None,
        }
    }
}

/// One HTTP client receiving a channel's stream
///
/// The response header is sent first, resuming from `header_sent` across
/// passes; the ring cursor only exists once the header is out.
#[derive(Debug)]
pub struct Consumer<S> {
    pub(crate) sink: S,
    info: ClientInfo,
    header: Bytes,
    pub(crate) header_sent: usize,
    pub(crate) cursor: Option<ReadCursor>,
    connected_at: Instant,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_dropped: u64,
}

impl<S: SocketSink> Consumer<S> {
    pub fn new(sink: S, header: Bytes, info: ClientInfo) -> Self {
        Self {
            sink,
            info,
            header,
            header_sent: 0,
            cursor: None,
            connected_at: Instant::now(),
            bytes_sent: 0,
            bytes_dropped: 0,
        }
    }

    /// Whether part of the response header is still unsent
    pub fn header_pending(&self) -> bool {
        self.header_sent < self.header.len()
    }

    /// Unsent tail of the response header, sharing the header's storage
    pub(crate) fn header_remaining(&self) -> Bytes {
        self.header.slice(self.header_sent..)
    }

    /// Best-effort 503 for a consumer torn down before its stream started
    ///
    /// Only sent when nothing of the 200 header reached the client yet. A
    /// consumer holding a partial header is closed without a response: a
    /// status line spliced into a half-written header would not parse.
    pub fn reject(&mut self) {
        if self.header_sent == 0 {
            let _ = self.sink.try_write(SERVICE_UNAVAILABLE);
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn cursor(&self) -> Option<ReadCursor> {
        self.cursor
    }

    /// Stream bytes sent, excluding the response header
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Bytes lost to ring overwrites
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped
    }
}
