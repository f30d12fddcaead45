//! Channel identity and source parameters

use std::collections::hash_map::DefaultHasher;
use std::ffi::{CStr, CString};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Duration;

use crate::runtime::WorkerId;

use super::error::RegistryError;

/// Registry key and public resource path of a channel
///
/// Rendered as `/udp/<address:port>@<interface-name>`; RTP and raw UDP
/// requests for the same source resolve to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Build the key for a source address received on `interface`
    pub fn new(addr: SocketAddr, interface: &Interface) -> Self {
        Self(format!("/udp/{}@{}", addr, interface.name()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Worker that owns this channel
    ///
    /// A stable hash, so every request for the same key lands on the same
    /// worker without searching the others.
    pub fn worker(&self, workers: usize) -> WorkerId {
        let mut hasher = DefaultHasher::new();
        self.0.hash(&mut hasher);
        (hasher.finish() % workers.max(1) as u64) as WorkerId
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network interface a source is received on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Interface {
    name: String,
    /// OS interface index (0 = let the kernel choose)
    index: u32,
}

impl Interface {
    /// Name used when no interface was requested
    pub const ANY: &'static str = "any";

    /// Let the kernel pick the interface
    pub fn any() -> Self {
        Self {
            name: Self::ANY.to_string(),
            index: 0,
        }
    }

    /// Look an interface up by name
    pub fn by_name(name: &str) -> Result<Self, RegistryError> {
        if name == Self::ANY {
            return Ok(Self::any());
        }
        let index = name_to_index(name)
            .ok_or_else(|| RegistryError::InterfaceNotFound(name.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            index,
        })
    }

    /// Look an interface up by index
    pub fn by_index(index: u32) -> Result<Self, RegistryError> {
        if index == 0 {
            return Ok(Self::any());
        }
        let name =
            index_to_name(index).ok_or_else(|| RegistryError::InterfaceNotFound(index.to_string()))?;
        Ok(Self { name, index })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

fn name_to_index(name: &str) -> Option<u32> {
    let name = CString::new(name).ok()?;
    // SAFETY: `name` is a valid NUL-terminated string for the whole call.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    (index != 0).then_some(index)
}

fn index_to_name(index: u32) -> Option<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    // SAFETY: `buf` holds IF_NAMESIZE bytes as if_indextoname requires.
    let ptr = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if ptr.is_null() {
        return None;
    }
    // SAFETY: on success the buffer contains a NUL-terminated name.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}

/// Everything needed to open a channel's source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceParams {
    /// Group (or unicast) address and port to receive on
    pub addr: SocketAddr,
    /// Interface used for the multicast join
    pub interface: Interface,
    /// Periodic leave + join interval (zero = never)
    pub rejoin_interval: Duration,
}

impl SourceParams {
    pub fn new(addr: SocketAddr, interface: Interface) -> Self {
        Self {
            addr,
            interface,
            rejoin_interval: Duration::ZERO,
        }
    }

    /// Set the rejoin interval
    pub fn rejoin_interval(mut self, interval: Duration) -> Self {
        self.rejoin_interval = interval;
        self
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.addr, &self.interface)
    }

    pub fn is_multicast(&self) -> bool {
        self.addr.ip().is_multicast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let params = SourceParams::new(
            "239.1.1.1:1234".parse().unwrap(),
            Interface {
                name: "eth0".into(),
                index: 2,
            },
        );
        assert_eq!(params.key().as_str(), "/udp/239.1.1.1:1234@eth0");
        assert!(params.is_multicast());
    }

    #[test]
    fn test_key_ignores_rejoin_interval() {
        let addr: SocketAddr = "239.1.1.1:1234".parse().unwrap();
        let a = SourceParams::new(addr, Interface::any());
        let b = SourceParams::new(addr, Interface::any()).rejoin_interval(Duration::from_secs(5));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_worker_is_stable() {
        let key = ChannelKey::new("239.1.1.1:1234".parse().unwrap(), &Interface::any());
        let first = key.worker(8);
        for _ in 0..10 {
            assert_eq!(key.clone().worker(8), first);
        }
        assert!(first < 8);
        assert_eq!(key.worker(1), 0);
    }

    #[test]
    fn test_loopback_lookup_round_trips() {
        let lo = Interface::by_name("lo").unwrap();
        assert!(lo.index() > 0);

        let again = Interface::by_index(lo.index()).unwrap();
        assert_eq!(again, lo);
    }

    #[test]
    fn test_unknown_interface() {
        assert!(matches!(
            Interface::by_name("no-such-if0"),
            Err(RegistryError::InterfaceNotFound(_))
        ));
        assert_eq!(Interface::by_name("any").unwrap(), Interface::any());
        assert_eq!(Interface::by_index(0).unwrap(), Interface::any());
    }
}
