//! Registry configuration

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ConfigError;

/// Largest datagram read from a source socket in one receive
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Status line and fixed headers sent to every stream consumer
const BASE_RESPONSE_HEADER: &str = concat!(
    "HTTP/1.1 200 OK\r\n",
    "Content-Type: video/mpeg\r\n",
    "Pragma: no-cache\r\n",
    "Cache-Control: no-cache\r\n",
    "Connection: close\r\n",
    "Server: udp-hub/",
    env!("CARGO_PKG_VERSION"),
    "\r\n",
);

/// Channel and consumer settings shared by every worker
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Ring buffer capacity per channel
    ///
    /// Ingest reserves [`MAX_DATAGRAM_SIZE`] bytes ahead of the write position
    /// for every receive, so the history a consumer can replay or lag behind
    /// is `ring_size - MAX_DATAGRAM_SIZE`. Must be at least two maximum
    /// datagrams.
    pub ring_size: usize,

    /// Bytes a new consumer starts behind the live edge
    pub precache: usize,

    /// Unread bytes required before a consumer is serviced
    pub min_send_block: usize,

    /// Consumer socket send buffer, also the largest single transmit
    pub socket_send_buf: usize,

    /// Consumer socket receive buffer (clients only send the request)
    pub socket_recv_buf: usize,

    /// Source socket receive buffer (0 = OS default)
    pub source_rcv_buf: usize,

    /// Bytes to accumulate before a send pass (0 = after every batch)
    pub source_rcv_lowat: usize,

    /// Destroy a channel when no datagram arrived for this long (zero = never)
    pub receive_timeout: Duration,

    /// Default multicast rejoin interval (zero = never)
    pub rejoin_interval: Duration,

    /// Disconnect consumers that fell behind and lost data
    pub drop_slow_clients: bool,

    /// Shut down the read side of consumer sockets after the request
    pub half_close: bool,

    /// Enable TCP_NODELAY on consumer sockets
    pub no_delay: bool,

    /// Enable TCP_CORK on consumer sockets
    pub no_push: bool,

    /// Force a congestion control algorithm on consumer sockets
    pub congestion_control: Option<String>,

    /// Extra response header lines, appended verbatim after normalisation
    pub custom_headers: String,

    /// Periodic sweep interval
    pub tick_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ring_size: 4 * 1024 * 1024,     // 4MB
            precache: 1024 * 1024,          // 1MB
            min_send_block: 64 * 1024,      // 64KB
            socket_send_buf: 512 * 1024,    // 512KB
            socket_recv_buf: 4 * 1024,      // 4KB
            source_rcv_buf: 512 * 1024,     // 512KB
            source_rcv_lowat: 0,
            receive_timeout: Duration::from_secs(10),
            rejoin_interval: Duration::ZERO,
            drop_slow_clients: false,
            half_close: true,
            no_delay: true,
            no_push: false,
            congestion_control: None,
            custom_headers: String::new(),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl RegistryConfig {
    /// Set the ring buffer size
    pub fn ring_size(mut self, size: usize) -> Self {
        self.ring_size = size;
        self
    }

    /// Set the precache lead for new consumers
    pub fn precache(mut self, size: usize) -> Self {
        self.precache = size;
        self
    }

    /// Set the minimum send block
    pub fn min_send_block(mut self, size: usize) -> Self {
        self.min_send_block = size;
        self
    }

    /// Set the consumer socket send buffer
    pub fn socket_send_buf(mut self, size: usize) -> Self {
        self.socket_send_buf = size;
        self
    }

    /// Set the source receive low-water mark
    pub fn source_rcv_lowat(mut self, bytes: usize) -> Self {
        self.source_rcv_lowat = bytes;
        self
    }

    /// Set the source receive timeout
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Set the default multicast rejoin interval
    pub fn rejoin_interval(mut self, interval: Duration) -> Self {
        self.rejoin_interval = interval;
        self
    }

    /// Disconnect consumers that lose data
    pub fn drop_slow_clients(mut self, enabled: bool) -> Self {
        self.drop_slow_clients = enabled;
        self
    }

    /// Force a congestion control algorithm
    pub fn congestion_control(mut self, name: impl Into<String>) -> Self {
        self.congestion_control = Some(name.into());
        self
    }

    /// Set extra response headers
    pub fn custom_headers(mut self, headers: impl Into<String>) -> Self {
        self.custom_headers = headers.into();
        self
    }

    /// Set the sweep interval
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let minimum = 2 * MAX_DATAGRAM_SIZE;
        if self.ring_size < minimum {
            return Err(ConfigError::RingTooSmall {
                ring_size: self.ring_size,
                minimum,
            });
        }
        if self.precache > self.ring_size {
            return Err(ConfigError::PrecacheExceedsRing {
                precache: self.precache,
                ring_size: self.ring_size,
            });
        }
        if self.min_send_block > self.socket_send_buf {
            return Err(ConfigError::SendBlockExceedsSendBuffer {
                min_send_block: self.min_send_block,
                socket_send_buf: self.socket_send_buf,
            });
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroTickInterval);
        }
        Ok(())
    }

    /// Render the full response header sent to stream consumers
    pub fn response_header(&self) -> Bytes {
        let custom = normalize_headers(&self.custom_headers);
        let mut buf = BytesMut::with_capacity(BASE_RESPONSE_HEADER.len() + custom.len() + 2);
        buf.put_slice(BASE_RESPONSE_HEADER.as_bytes());
        buf.put_slice(custom.as_bytes());
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}

/// Turn free-form header text into CRLF-terminated lines
///
/// Accepts `\n` or `\r\n` separators; blank lines are dropped so the custom
/// block cannot terminate the header early.
pub fn normalize_headers(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 16);
    for line in raw.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RegistryConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.min_send_block, 64 * 1024);
        assert!(!config.drop_slow_clients);
        assert!(config.half_close);
        assert!(config.no_delay);
        assert_eq!(config.tick_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_precache_larger_than_ring_rejected() {
        let config = RegistryConfig::default()
            .ring_size(1024 * 1024)
            .precache(2 * 1024 * 1024);

        assert_eq!(
            config.validate(),
            Err(ConfigError::PrecacheExceedsRing {
                precache: 2 * 1024 * 1024,
                ring_size: 1024 * 1024,
            })
        );
    }

    #[test]
    fn test_send_block_larger_than_send_buffer_rejected() {
        let config = RegistryConfig::default()
            .socket_send_buf(32 * 1024)
            .min_send_block(64 * 1024);

        assert!(matches!(
            config.validate(),
            Err(ConfigError::SendBlockExceedsSendBuffer { .. })
        ));
    }

    #[test]
    fn test_tiny_ring_rejected() {
        let config = RegistryConfig::default().ring_size(1024).precache(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RingTooSmall { .. })
        ));
    }

    #[test]
    fn test_zero_tick_rejected() {
        let config = RegistryConfig::default().tick_interval(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroTickInterval));
    }

    #[test]
    fn test_normalize_headers() {
        assert_eq!(normalize_headers(""), "");
        assert_eq!(
            normalize_headers("X-One: 1\nX-Two: 2\r\n\r\n"),
            "X-One: 1\r\nX-Two: 2\r\n"
        );
    }

    #[test]
    fn test_response_header_layout() {
        let header = RegistryConfig::default()
            .custom_headers("Access-Control-Allow-Origin: *\n")
            .response_header();
        let text = std::str::from_utf8(&header).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: video/mpeg\r\n"));
        assert!(text.ends_with("Access-Control-Allow-Origin: *\r\n\r\n"));
        assert_eq!(text.matches("\r\n\r\n").count(), 1);
    }

    #[test]
    fn test_builder_chaining() {
        let config = RegistryConfig::default()
            .receive_timeout(Duration::from_secs(2))
            .rejoin_interval(Duration::from_secs(30))
            .drop_slow_clients(true)
            .congestion_control("bbr")
            .source_rcv_lowat(48 * 1024);

        assert_eq!(config.receive_timeout, Duration::from_secs(2));
        assert_eq!(config.rejoin_interval, Duration::from_secs(30));
        assert!(config.drop_slow_clients);
        assert_eq!(config.congestion_control.as_deref(), Some("bbr"));
        assert_eq!(config.source_rcv_lowat, 48 * 1024);
    }
}
