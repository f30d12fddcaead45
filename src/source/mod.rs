//! Source sockets
//!
//! Opening, joining and re-joining the UDP socket a channel receives from.
//! The socket is created with `socket2` so the receive buffer, address reuse
//! and the interface-index multicast join can be set before it is handed to
//! tokio.

pub mod ingest;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::AsFd;

use socket2::{Domain, InterfaceIndexOrAddress, Protocol, SockRef, Socket, Type};

use crate::registry::{RegistryError, SourceParams};

pub use ingest::{Batch, DatagramSource, Ingest};

/// Create, bind and join the source socket for `params`
///
/// Binding the exact group address filters out other groups sharing the
/// port; when that fails the socket falls back to the wildcard address with
/// the same port.
pub fn open(params: &SourceParams, rcv_buf: usize) -> Result<UdpSocket, RegistryError> {
    let key = params.key();
    let bind_err = |e| RegistryError::Bind(key.clone(), e);

    let socket = Socket::new(
        Domain::for_address(params.addr),
        Type::DGRAM,
        Some(Protocol::UDP),
    )
    .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    if rcv_buf > 0 {
        if let Err(e) = socket.set_recv_buffer_size(rcv_buf) {
            tracing::warn!(channel = %key, error = %e, "Failed to set source receive buffer");
        }
    }

    if let Err(e) = socket.bind(&params.addr.into()) {
        let wildcard = wildcard(params.addr);
        tracing::debug!(
            channel = %key,
            error = %e,
            fallback = %wildcard,
            "Binding source address failed, using wildcard"
        );
        socket.bind(&wildcard.into()).map_err(bind_err)?;
    }

    if params.is_multicast() {
        join(&socket, params).map_err(|e| RegistryError::Join(key.clone(), e))?;
    }

    tracing::debug!(channel = %key, interface_index = params.interface.index(), "Source opened");
    Ok(socket.into())
}

fn wildcard(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(a) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), a.port()),
        SocketAddr::V6(a) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), a.port()),
    }
}

/// Join the multicast group of `params` on its interface
pub fn join(socket: &Socket, params: &SourceParams) -> io::Result<()> {
    let index = params.interface.index();
    match params.addr.ip() {
        IpAddr::V4(group) => {
            socket.join_multicast_v4_n(&group, &InterfaceIndexOrAddress::Index(index))
        }
        IpAddr::V6(group) => socket.join_multicast_v6(&group, index),
    }
}

/// Leave the multicast group of `params`
pub fn leave(socket: &Socket, params: &SourceParams) -> io::Result<()> {
    let index = params.interface.index();
    match params.addr.ip() {
        IpAddr::V4(group) => {
            socket.leave_multicast_v4_n(&group, &InterfaceIndexOrAddress::Index(index))
        }
        IpAddr::V6(group) => socket.leave_multicast_v6(&group, index),
    }
}

/// Leave and join again to refresh upstream routing state
///
/// A failed leave is ignored (the membership may already be gone); a failed
/// join is returned to the caller.
pub fn rejoin<S: AsFd>(socket: &S, params: &SourceParams) -> io::Result<()> {
    if !params.is_multicast() {
        return Ok(());
    }
    let sock = SockRef::from(socket);
    if let Err(e) = leave(&sock, params) {
        tracing::trace!(channel = %params.key(), error = %e, "Multicast leave failed");
    }
    join(&sock, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Interface;

    #[test]
    fn test_wildcard_keeps_port() {
        let v4 = wildcard("239.0.0.1:5000".parse().unwrap());
        assert_eq!(v4, "0.0.0.0:5000".parse::<SocketAddr>().unwrap());

        let v6 = wildcard("[ff15::1]:6000".parse().unwrap());
        assert_eq!(v6, "[::]:6000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_open_unicast_source() {
        let params = SourceParams::new("127.0.0.1:0".parse().unwrap(), Interface::any());
        let socket = open(&params, 64 * 1024).unwrap();

        let local = socket.local_addr().unwrap();
        assert_eq!(local.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(local.port(), 0);

        // Non-multicast sources have nothing to rejoin
        assert!(rejoin(&socket, &params).is_ok());
    }
}
