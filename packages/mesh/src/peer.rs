//! Peer descriptors exchanged through the brokerage directory.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::compress::Format;

/// Version of the wire protocol: framing, discriminators, field ordering.
///
/// Descriptors are published under a directory named for this version, so
/// incompatible peers never see each other. Bump on any framing change.
pub const CURRENT_PEERVERSION: u32 = 1;

/// Hardware inventory a worker advertises.
#[derive(Clone, Default, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Hardware {
    pub cpu_name: String,
    /// Physical cores.
    pub cores: u32,
    /// Logical threads.
    pub threads: u32,
    pub mhz: u64,
    pub ram_bytes: u64,
}

/// A worker's advertisement, persisted as JSON in the brokerage directory
/// under a file named for the FQDN.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub version: u32,
    pub fqdn: String,
    pub addr: IpAddr,
    pub tunnel_port: u16,
    pub compression: Format,
    pub hardware: Hardware,
}

impl PeerDescriptor {
    /// The socket address a client dials.
    pub fn tunnel_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.tunnel_port)
    }

    /// Whether this descriptor speaks our protocol.
    pub fn is_compatible(&self) -> bool {
        self.version == CURRENT_PEERVERSION
    }
}

impl Default for PeerDescriptor {
    fn default() -> Self {
        Self {
            version: CURRENT_PEERVERSION,
            fqdn: String::new(),
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tunnel_port: 0,
            compression: Format::default(),
            hardware: Hardware::default(),
        }
    }
}
