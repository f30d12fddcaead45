//! Send pass
//!
//! One pass services every consumer of a channel once: finish the response
//! header, check for drops, then transmit whatever the ring holds for the
//! consumer in one non-blocking call.

use std::fmt;
use std::io;

use crate::registry::RegistryConfig;
use crate::ring::transmit::is_transient;
use crate::ring::{RingBuffer, SocketSink};

use super::consumer::Consumer;

/// Settings that drive a send pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPolicy {
    /// Lead behind the live edge for a consumer's first byte
    pub precache: usize,
    /// Minimum unread bytes before a consumer is serviced
    pub min_send_block: usize,
    /// Largest single transmit
    pub max_send: usize,
    /// Disconnect consumers that lost data
    pub drop_slow_clients: bool,
}

impl From<&RegistryConfig> for SendPolicy {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            precache: config.precache,
            min_send_block: config.min_send_block,
            max_send: config.socket_send_buf,
            drop_slow_clients: config.drop_slow_clients,
        }
    }
}

/// Why a consumer was removed
#[derive(Debug)]
pub enum CloseReason {
    /// Fell behind far enough to lose data
    SlowClient { dropped: u64 },
    /// Socket failed
    Io(io::Error),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::SlowClient { dropped } => {
                write!(f, "slow client, {} bytes dropped", dropped)
            }
            CloseReason::Io(e) => write!(f, "socket error: {}", e),
        }
    }
}

/// Outcome of one pass
#[derive(Debug)]
pub struct PassReport<S> {
    /// Stream bytes accepted by all sockets
    pub bytes_sent: u64,
    /// Consumers removed during the pass, in their original order
    pub closed: Vec<(Consumer<S>, CloseReason)>,
}

impl<S> PassReport<S> {
    fn new() -> Self {
        Self {
            bytes_sent: 0,
            closed: Vec::new(),
        }
    }
}

impl<S: SocketSink> Consumer<S> {
    /// Service this consumer once; `Err` means it must be removed
    pub(crate) fn service(
        &mut self,
        ring: &mut RingBuffer,
        policy: &SendPolicy,
    ) -> Result<usize, CloseReason> {
        if self.header_pending() {
            let remaining = self.header_remaining();
            match self.sink.try_write(&remaining) {
                Ok(n) => self.header_sent += n,
                Err(e) if is_transient(&e) => return Ok(0),
                Err(e) => return Err(CloseReason::Io(e)),
            }
            if self.header_pending() {
                return Ok(0);
            }
            self.cursor = Some(ring.init_read_cursor(policy.precache));
        }

        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(0);
        };

        let avail = ring.available_for(cursor);
        if avail.dropped > 0 {
            self.bytes_dropped += avail.dropped;
            if policy.drop_slow_clients {
                return Err(CloseReason::SlowClient {
                    dropped: avail.dropped,
                });
            }
        }
        if avail.unread == 0 || avail.unread < policy.min_send_block {
            return Ok(0);
        }

        let window = ring.read_window(cursor, policy.max_send);
        match ring.transmit(&window, &mut self.sink) {
            Ok(n) => {
                ring.advance_read_cursor(cursor, n);
                self.bytes_sent += n as u64;
                Ok(n)
            }
            Err(e) if is_transient(&e) => Ok(0),
            Err(e) => Err(CloseReason::Io(e)),
        }
    }
}

/// Service every consumer once, removing the ones that failed
pub fn send_pass<S: SocketSink>(
    ring: &mut RingBuffer,
    consumers: &mut Vec<Consumer<S>>,
    policy: &SendPolicy,
) -> PassReport<S> {
    let mut report = PassReport::new();
    let mut i = 0;

    while i < consumers.len() {
        match consumers[i].service(ring, policy) {
            Ok(n) => {
                report.bytes_sent += n as u64;
                i += 1;
            }
            Err(reason) => {
                let consumer = consumers.remove(i);
                report.closed.push((consumer, reason));
            }
        }
    }

    report
}
