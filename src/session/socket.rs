//! Consumer socket options
//!
//! Consumers only ever send, so the socket gets a small receive buffer, its
//! read side shut down, and a send buffer sized to the largest transmit.

use std::net::Shutdown;

use socket2::SockRef;
use tokio::net::TcpStream;

use crate::registry::RegistryConfig;

/// Socket state shown on the diagnostics page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketDiagnostics {
    pub send_buffer: Option<usize>,
    pub congestion: Option<String>,
    pub no_delay: Option<bool>,
}

/// Apply consumer socket options
///
/// Every option is best effort: a failure is logged and the consumer is still
/// served.
pub fn tune(stream: &TcpStream, config: &RegistryConfig) {
    let sock = SockRef::from(stream);
    let peer = stream.peer_addr().ok();

    let check = |option: &str, result: std::io::Result<()>| {
        if let Err(e) = result {
            tracing::debug!(peer = ?peer, option = option, error = %e, "Socket option not applied");
        }
    };

    if config.socket_recv_buf > 0 {
        check("recv_buffer", sock.set_recv_buffer_size(config.socket_recv_buf));
    }
    if config.half_close {
        check("half_close", sock.shutdown(Shutdown::Read));
    }
    if config.no_delay {
        check("no_delay", sock.set_nodelay(true));
    }
    #[cfg(target_os = "linux")]
    {
        if config.no_push {
            check("no_push", sock.set_cork(true));
        }
        if let Some(name) = config.congestion_control.as_deref() {
            check("congestion_control", sock.set_tcp_congestion(name.as_bytes()));
        }
    }
    if config.socket_send_buf > 0 {
        check("send_buffer", sock.set_send_buffer_size(config.socket_send_buf));
    }
}

/// Read back the options worth showing
pub fn diagnostics(stream: &TcpStream) -> SocketDiagnostics {
    let sock = SockRef::from(stream);

    #[cfg(target_os = "linux")]
    let congestion = sock
        .tcp_congestion()
        .ok()
        .map(|name| String::from_utf8_lossy(&name).trim_end_matches('\0').to_string());
    #[cfg(not(target_os = "linux"))]
    let congestion = None;

    SocketDiagnostics {
        send_buffer: sock.send_buffer_size().ok(),
        congestion,
        no_delay: sock.nodelay().ok(),
    }
}
