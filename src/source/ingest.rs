//! Source ingest
//!
//! Drains every datagram that is ready on a source socket, keeps the
//! transport-stream payload and appends it to the channel's ring buffer.
//!
//! Datagrams are received straight into the ring's write reservation; RTP
//! payloads are then shifted to the start of the reservation before commit.
//! Near the wrap point, where a full datagram no longer fits contiguously,
//! the datagram goes through a scratch buffer instead.

use std::io;

use tokio::net::UdpSocket;

use crate::media::demux;
use crate::registry::config::MAX_DATAGRAM_SIZE;
use crate::ring::RingBuffer;

/// Datagrams taken per drain before the worker gets a chance to run others
pub const DRAIN_BUDGET: usize = 256;

/// Non-blocking datagram receive
pub trait DatagramSource {
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

impl DatagramSource for UdpSocket {
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::try_recv(self, buf)
    }
}

impl DatagramSource for std::net::UdpSocket {
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

/// Counters for one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Batch {
    /// Datagrams received, including rejected ones
    pub datagrams: usize,
    /// Payload bytes written to the ring
    pub bytes: usize,
    /// Datagrams discarded by the demultiplexer
    pub rejected: usize,
    /// Stopped at [`DRAIN_BUDGET`] with the source possibly still readable
    pub more: bool,
}

/// Per-channel ingest state
#[derive(Debug)]
pub struct Ingest {
    /// Bytes to accumulate before a send pass is due
    lowat: usize,
    /// Bytes written since the last send pass
    pending: usize,
    scratch: Vec<u8>,
}

impl Ingest {
    pub fn new(lowat: usize) -> Self {
        Self {
            lowat,
            pending: 0,
            scratch: Vec::new(),
        }
    }

    /// Receive until the source would block or the budget is spent
    ///
    /// Interrupted receives are retried; any other error ends the drain and is
    /// returned, since the source is assumed gone.
    pub fn drain<D: DatagramSource + ?Sized>(
        &mut self,
        source: &D,
        ring: &mut RingBuffer,
    ) -> io::Result<Batch> {
        let mut batch = Batch::default();

        loop {
            if batch.datagrams >= DRAIN_BUDGET {
                batch.more = true;
                break;
            }

            let received = if ring.reserve_write(MAX_DATAGRAM_SIZE).len() >= MAX_DATAGRAM_SIZE {
                self.recv_in_place(source, ring)
            } else {
                ring.commit_write(0);
                self.recv_via_scratch(source, ring)
            };

            match received {
                Ok(Some(written)) => {
                    batch.datagrams += 1;
                    batch.bytes += written;
                }
                Ok(None) => {
                    batch.datagrams += 1;
                    batch.rejected += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.pending += batch.bytes;
        Ok(batch)
    }

    /// Whether enough data arrived since the last send pass
    ///
    /// Emulates a socket low-water mark: with a threshold of zero every batch
    /// that produced data triggers a pass.
    pub fn take_send_due(&mut self) -> bool {
        if self.pending > 0 && self.pending >= self.lowat {
            self.pending = 0;
            true
        } else {
            false
        }
    }

    fn recv_in_place<D: DatagramSource + ?Sized>(
        &mut self,
        source: &D,
        ring: &mut RingBuffer,
    ) -> io::Result<Option<usize>> {
        let slot = ring.reserve_write(MAX_DATAGRAM_SIZE);
        let n = match source.try_recv(slot) {
            Ok(n) => n,
            Err(e) => {
                ring.commit_write(0);
                return Err(e);
            }
        };

        let written = match demux::demux(&slot[..n]) {
            Ok(payload) => {
                let range = payload.range();
                if range.start > 0 {
                    slot.copy_within(range.clone(), 0);
                }
                Some(range.len())
            }
            Err(_) => None,
        };
        ring.commit_write(written.unwrap_or(0));
        Ok(written)
    }

    fn recv_via_scratch<D: DatagramSource + ?Sized>(
        &mut self,
        source: &D,
        ring: &mut RingBuffer,
    ) -> io::Result<Option<usize>> {
        if self.scratch.len() < MAX_DATAGRAM_SIZE {
            self.scratch.resize(MAX_DATAGRAM_SIZE, 0);
        }

        let n = source.try_recv(&mut self.scratch)?;
        match demux::demux(&self.scratch[..n]) {
            Ok(payload) => {
                let range = payload.range();
                ring.write(&self.scratch[range.clone()]);
                Ok(Some(range.len()))
            }
            Err(_) => Ok(None),
        }
    }
}
