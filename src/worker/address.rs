//! Discovery of the address a worker advertises

use crate::common::{Error, Result};
use std::net::{IpAddr, SocketAddr, UdpSocket};

/// Produces the externally reachable address of this process
pub trait AddressResolver: Send + Sync {
    fn resolve(&self) -> Result<String>;
}

/// Finds the IP of the interface that routes to `target`.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
#[derive(Debug, Clone)]
pub struct ExternalIp {
    target: SocketAddr,
}

impl ExternalIp {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl Default for ExternalIp {
    fn default() -> Self {
        Self::new(SocketAddr::from(([8, 8, 8, 8], 80)))
    }
}

impl AddressResolver for ExternalIp {
    fn resolve(&self) -> Result<String> {
        let bind: SocketAddr = match self.target {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(self.target)?;
        let ip = socket.local_addr()?.ip();
        if ip.is_loopback() || ip.is_unspecified() {
            return Err(Error::Other(format!(
                "no external interface routes to {}, got {}",
                self.target, ip
            )));
        }
        Ok(ip.to_string())
    }
}

/// A fixed, operator-supplied address
#[derive(Debug, Clone)]
pub struct StaticAddress(pub String);

impl AddressResolver for StaticAddress {
    fn resolve(&self) -> Result<String> {
        if self.0.is_empty() {
            return Err(Error::InvalidConfig("advertised address is empty".into()));
        }
        Ok(self.0.clone())
    }
}

impl From<IpAddr> for StaticAddress {
    fn from(ip: IpAddr) -> Self {
        StaticAddress(ip.to_string())
    }
}
