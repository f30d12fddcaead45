//! Fixed-capacity broadcast ring buffer
//!
//! One producer appends bytes; any number of independent [`ReadCursor`]s
//! follow it at their own pace. Positions are absolute byte offsets since the
//! buffer was created, so a cursor's position also tells which "lap" of the
//! backing store it refers to.
//!
//! ```text
//!             oldest                         write_pos
//!               │                                │
//!   ────────────┼────────── history ─────────────┼──── reserved ──►
//!               │◄──────── <= capacity ─────────►│
//!          cursor A (lapped: dropped = oldest - A)
//!                          cursor B (unread = write_pos - B)
//! ```
//!
//! A span handed out by [`RingBuffer::reserve_write`] is treated as
//! overwritten from the moment it is reserved, which keeps a partially
//! committed write from ever being read back as history.

pub mod transmit;

use std::io;

pub use transmit::SocketSink;

/// Read position of one consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCursor {
    pos: u64,
}

impl ReadCursor {
    /// Absolute byte position of the next unread byte
    pub fn position(&self) -> u64 {
        self.pos
    }
}

/// Result of [`RingBuffer::available_for`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Availability {
    /// Bytes ready to be read
    pub unread: usize,
    /// Bytes lost since the last query because the producer lapped the cursor
    pub dropped: u64,
}

/// Contiguous region of the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    pub offset: usize,
    pub len: usize,
}

/// Up to two segments describing a read that may cross the wrap point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    segments: [Segment; 2],
    count: usize,
}

impl Window {
    pub fn segments(&self) -> &[Segment] {
        &self.segments[..self.count]
    }

    /// Total bytes covered by the window
    pub fn len(&self) -> usize {
        self.segments().iter().map(|s| s.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Circular byte store with one write cursor and many read cursors
#[derive(Debug)]
pub struct RingBuffer {
    store: Box<[u8]>,
    /// Total bytes committed since creation
    write_pos: u64,
    /// Oldest absolute position whose byte is still intact
    oldest: u64,
    /// Length of the outstanding reservation
    reserved: usize,
    /// Staging area for the copy-then-send fallback
    scratch: Vec<u8>,
}

impl RingBuffer {
    /// Create a ring buffer backed by `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            store: vec![0u8; capacity.max(1)].into_boxed_slice(),
            write_pos: 0,
            oldest: 0,
            reserved: 0,
            scratch: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.store.len()
    }

    /// Absolute position the next committed byte will get
    pub fn write_position(&self) -> u64 {
        self.write_pos
    }

    /// Bytes of intact history behind the write position
    pub fn history(&self) -> u64 {
        self.write_pos - self.oldest
    }

    /// Reserve a contiguous region of 1..=`hint` bytes at the write position
    ///
    /// The region never crosses the end of the backing store, so it may be
    /// shorter than `hint` near the wrap point.
    pub fn reserve_write(&mut self, hint: usize) -> &mut [u8] {
        let cap = self.store.len();
        let start = (self.write_pos % cap as u64) as usize;
        let len = hint.max(1).min(cap - start);

        let end = self.write_pos + len as u64;
        self.oldest = self.oldest.max(end.saturating_sub(cap as u64));
        self.reserved = len;

        &mut self.store[start..start + len]
    }

    /// Commit `written` bytes of the last reservation
    pub fn commit_write(&mut self, written: usize) {
        let written = written.min(self.reserved);
        self.write_pos += written as u64;
        self.reserved = 0;
    }

    /// Append `data`, splitting it across the wrap point when needed
    pub fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let slot = self.reserve_write(data.len());
            let n = slot.len();
            slot.copy_from_slice(&data[..n]);
            self.commit_write(n);
            data = &data[n..];
        }
    }

    /// Create a cursor `precache` bytes behind the live edge
    ///
    /// The lead is clamped to the intact history, so a cursor on a young
    /// buffer starts at the oldest byte still available.
    pub fn init_read_cursor(&self, precache: usize) -> ReadCursor {
        let back = (precache as u64).min(self.history());
        ReadCursor {
            pos: self.write_pos - back,
        }
    }

    /// Report unread and dropped bytes for `cursor`
    ///
    /// A lapped cursor is moved forward to the oldest intact byte, so it can
    /// never reference overwritten data afterwards.
    pub fn available_for(&self, cursor: &mut ReadCursor) -> Availability {
        let mut dropped = 0;
        if cursor.pos < self.oldest {
            dropped = self.oldest - cursor.pos;
            cursor.pos = self.oldest;
        }

        Availability {
            unread: (self.write_pos - cursor.pos) as usize,
            dropped,
        }
    }

    /// Describe up to `max` unread bytes as offsets into the backing store
    pub fn read_window(&self, cursor: &ReadCursor, max: usize) -> Window {
        let pos = cursor.pos.max(self.oldest);
        let unread = (self.write_pos - pos) as usize;
        let len = unread.min(max);

        let mut window = Window::default();
        if len == 0 {
            return window;
        }

        let cap = self.store.len();
        let start = (pos % cap as u64) as usize;
        let first = len.min(cap - start);

        window.segments[0] = Segment {
            offset: start,
            len: first,
        };
        window.count = 1;

        if len > first {
            window.segments[1] = Segment {
                offset: 0,
                len: len - first,
            };
            window.count = 2;
        }

        window
    }

    /// Move `cursor` forward by `consumed` bytes
    pub fn advance_read_cursor(&self, cursor: &mut ReadCursor, consumed: usize) {
        cursor.pos = (cursor.pos + consumed as u64).min(self.write_pos);
    }

    /// Borrow the bytes a segment refers to
    pub fn segment_bytes(&self, segment: Segment) -> &[u8] {
        &self.store[segment.offset..segment.offset + segment.len]
    }

    /// Send the window straight from the backing store to `sink`
    ///
    /// Sinks with vectored writes get borrowed slices of the store in a single
    /// call. Other sinks go through the copy-then-send path. Returns the bytes
    /// actually accepted by the sink, which may be fewer than the window.
    pub fn transmit<S: SocketSink + ?Sized>(
        &mut self,
        window: &Window,
        sink: &mut S,
    ) -> io::Result<usize> {
        if window.is_empty() {
            return Ok(0);
        }

        if sink.is_write_vectored() {
            let slices: Vec<io::IoSlice<'_>> = window
                .segments()
                .iter()
                .map(|s| io::IoSlice::new(&self.store[s.offset..s.offset + s.len]))
                .collect();
            return sink.try_write_vectored(&slices);
        }

        self.scratch.clear();
        for s in window.segments() {
            self.scratch
                .extend_from_slice(&self.store[s.offset..s.offset + s.len]);
        }
        sink.try_write(&self.scratch)
    }
}

#[cfg(test)]
mod tests {
    use super::transmit::testing::MockSink;
    use super::*;

    /// Byte value stored at absolute position `pos` by `fill_sequential`
    fn pattern(pos: u64) -> u8 {
        (pos % 251) as u8
    }

    fn fill_sequential(ring: &mut RingBuffer, count: usize) {
        let start = ring.write_position();
        let data: Vec<u8> = (0..count as u64).map(|i| pattern(start + i)).collect();
        ring.write(&data);
    }

    fn read_all(ring: &RingBuffer, cursor: &ReadCursor, max: usize) -> Vec<u8> {
        let window = ring.read_window(cursor, max);
        let mut out = Vec::new();
        for s in window.segments() {
            out.extend_from_slice(ring.segment_bytes(*s));
        }
        out
    }

    #[test]
    fn test_reserve_and_commit() {
        let mut ring = RingBuffer::with_capacity(16);

        let slot = ring.reserve_write(4);
        assert_eq!(slot.len(), 4);
        slot.copy_from_slice(b"abcd");
        ring.commit_write(4);

        assert_eq!(ring.write_position(), 4);
        assert_eq!(ring.history(), 4);
    }

    #[test]
    fn test_reserve_stops_at_wrap_point() {
        let mut ring = RingBuffer::with_capacity(16);
        fill_sequential(&mut ring, 12);

        let slot = ring.reserve_write(10);
        assert_eq!(slot.len(), 4);
        ring.commit_write(0);

        // A zero hint still yields one byte
        let slot = ring.reserve_write(0);
        assert_eq!(slot.len(), 1);
    }

    #[test]
    fn test_partial_commit_invalidates_reserved_span() {
        let mut ring = RingBuffer::with_capacity(16);
        fill_sequential(&mut ring, 16);
        let mut cursor = ring.init_read_cursor(16);
        assert_eq!(cursor.position(), 0);

        // Reserve 8 bytes over the oldest history but commit only 2
        let _ = ring.reserve_write(8);
        ring.commit_write(2);

        let avail = ring.available_for(&mut cursor);
        assert_eq!(avail.dropped, 8);
        assert_eq!(cursor.position(), 8);
        assert_eq!(avail.unread, 10);
    }

    #[test]
    fn test_precache_is_clamped_to_history() {
        let mut ring = RingBuffer::with_capacity(64);
        fill_sequential(&mut ring, 10);

        let cursor = ring.init_read_cursor(32);
        assert_eq!(cursor.position(), 0);

        let cursor = ring.init_read_cursor(4);
        assert_eq!(cursor.position(), 6);
    }

    #[test]
    fn test_window_crosses_wrap_point() {
        let mut ring = RingBuffer::with_capacity(16);
        fill_sequential(&mut ring, 12);
        let mut cursor = ring.init_read_cursor(0);
        fill_sequential(&mut ring, 8);

        let avail = ring.available_for(&mut cursor);
        assert_eq!(avail.unread, 8);
        assert_eq!(avail.dropped, 0);

        let window = ring.read_window(&cursor, 64);
        assert_eq!(window.segments().len(), 2);
        assert_eq!(window.segments()[0], Segment { offset: 12, len: 4 });
        assert_eq!(window.segments()[1], Segment { offset: 0, len: 4 });

        let expected: Vec<u8> = (12..20).map(pattern).collect();
        assert_eq!(read_all(&ring, &cursor, 64), expected);
    }

    #[test]
    fn test_lagging_reader_never_sees_pre_gap_bytes() {
        let mut ring = RingBuffer::with_capacity(100);
        let mut cursor = ring.init_read_cursor(0);

        for step in 0..50 {
            fill_sequential(&mut ring, 37);

            let avail = ring.available_for(&mut cursor);
            assert!(avail.unread <= ring.capacity());

            // Read a little every few steps so the reader keeps falling behind
            if step % 3 == 0 {
                let data = read_all(&ring, &cursor, 20);
                let expected: Vec<u8> = (cursor.position()..cursor.position() + data.len() as u64)
                    .map(pattern)
                    .collect();
                assert_eq!(data, expected);
                ring.advance_read_cursor(&mut cursor, data.len());
            }
        }
    }

    #[test]
    fn test_dropped_reported_once() {
        let mut ring = RingBuffer::with_capacity(32);
        let mut cursor = ring.init_read_cursor(0);
        fill_sequential(&mut ring, 40);

        let first = ring.available_for(&mut cursor);
        assert_eq!(first.dropped, 8);
        assert_eq!(first.unread, 32);

        let second = ring.available_for(&mut cursor);
        assert_eq!(second.dropped, 0);
        assert_eq!(second.unread, 32);
    }

    #[test]
    fn test_advance_is_bounded_by_write_position() {
        let mut ring = RingBuffer::with_capacity(32);
        fill_sequential(&mut ring, 10);
        let mut cursor = ring.init_read_cursor(10);

        ring.advance_read_cursor(&mut cursor, 100);
        assert_eq!(cursor.position(), 10);
        assert_eq!(ring.available_for(&mut cursor).unread, 0);
    }

    #[test]
    fn test_transmit_vectored_and_copy_paths() {
        for vectored in [true, false] {
            let mut ring = RingBuffer::with_capacity(16);
            fill_sequential(&mut ring, 12);
            let cursor = ring.init_read_cursor(0);
            fill_sequential(&mut ring, 8);

            let mut sink = MockSink::new().vectored(vectored);
            let window = ring.read_window(&cursor, 64);
            let sent = ring.transmit(&window, &mut sink).unwrap();

            assert_eq!(sent, 8);
            let expected: Vec<u8> = (12..20).map(pattern).collect();
            assert_eq!(sink.written, expected);
        }
    }

    #[test]
    fn test_transmit_partial() {
        let mut ring = RingBuffer::with_capacity(64);
        fill_sequential(&mut ring, 40);
        let mut cursor = ring.init_read_cursor(40);

        let mut sink = MockSink::new().budget(15);
        let window = ring.read_window(&cursor, 64);
        let sent = ring.transmit(&window, &mut sink).unwrap();
        assert_eq!(sent, 15);

        ring.advance_read_cursor(&mut cursor, sent);
        assert_eq!(ring.available_for(&mut cursor).unread, 25);

        let window = ring.read_window(&cursor, 64);
        let err = ring.transmit(&window, &mut sink).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
