// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Transport addresses (TCP, UDP, SCTP) and the canonical keys derived from them.

use crate::PortMapperError;
use portalloc::Protocol;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tracing::error;

/// An SCTP address: SCTP associations may be multi-homed, so the address carries a list of IP
/// addresses sharing a single port. An empty list is representable, but invalid for any
/// port-mapping operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SctpAddr {
    ips: Vec<IpAddr>,
    port: u16,
}

impl SctpAddr {
    #[must_use]
    pub fn new(ips: Vec<IpAddr>, port: u16) -> Self {
        Self { ips, port }
    }

    #[must_use]
    pub fn ips(&self) -> &[IpAddr] {
        &self.ips
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// A transport-level address, for one of the supported protocols.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportAddr {
    Tcp(SocketAddr),
    Udp(SocketAddr),
    Sctp(SctpAddr),
}

impl TransportAddr {
    /// Build a single-IP address of the variant matching `proto`.
    #[must_use]
    pub fn new(proto: Protocol, ip: IpAddr, port: u16) -> Self {
        match proto {
            Protocol::Tcp => TransportAddr::Tcp(SocketAddr::new(ip, port)),
            Protocol::Udp => TransportAddr::Udp(SocketAddr::new(ip, port)),
            Protocol::Sctp => TransportAddr::Sctp(SctpAddr::new(vec![ip], port)),
        }
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        match self {
            TransportAddr::Tcp(_) => Protocol::Tcp,
            TransportAddr::Udp(_) => Protocol::Udp,
            TransportAddr::Sctp(_) => Protocol::Sctp,
        }
    }

    /// First IP address of the address, if any.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            TransportAddr::Tcp(addr) | TransportAddr::Udp(addr) => Some(addr.ip()),
            TransportAddr::Sctp(addr) => addr.ips.first().copied(),
        }
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            TransportAddr::Tcp(addr) | TransportAddr::Udp(addr) => addr.port(),
            TransportAddr::Sctp(addr) => addr.port,
        }
    }

    /// Reject addresses that cannot take part in a mapping.
    ///
    /// # Errors
    ///
    /// Returns [`PortMapperError::SctpAddressMissingIp`] for an SCTP address with no IP address.
    pub fn validate(&self) -> Result<(), PortMapperError> {
        self.ip_and_port().map(|_| ())
    }

    /// First IP address and port.
    ///
    /// # Errors
    ///
    /// Returns [`PortMapperError::SctpAddressMissingIp`] for an SCTP address with no IP address.
    pub fn ip_and_port(&self) -> Result<(IpAddr, u16), PortMapperError> {
        let Some(ip) = self.ip() else {
            error!("{}", PortMapperError::SctpAddressMissingIp);
            return Err(PortMapperError::SctpAddressMissingIp);
        };
        Ok((ip, self.port()))
    }

    /// Canonical registry key for this address.
    ///
    /// # Errors
    ///
    /// Returns [`PortMapperError::SctpAddressMissingIp`] for an SCTP address with no IP address.
    pub fn key(&self) -> Result<MappingKey, PortMapperError> {
        let (ip, port) = self.ip_and_port()?;
        Ok(MappingKey::new(ip, port, self.protocol()))
    }
}

impl Display for TransportAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportAddr::Tcp(addr) | TransportAddr::Udp(addr) => write!(f, "{addr}")?,
            TransportAddr::Sctp(addr) => {
                for (i, ip) in addr.ips.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    match ip {
                        IpAddr::V4(ip) => write!(f, "{ip}")?,
                        IpAddr::V6(ip) => write!(f, "[{ip}]")?,
                    }
                }
                write!(f, ":{}", addr.port)?;
            }
        }
        write!(f, "/{}", self.protocol())
    }
}

/// Parse `<ip>:<port>/<proto>`, with IPv6 addresses in brackets (`[::1]:80/tcp`).
impl FromStr for TransportAddr {
    type Err = PortMapperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((socket, proto)) = s.rsplit_once('/') else {
            return Err(PortMapperError::InvalidAddress(s.to_string()));
        };
        let proto = Protocol::from_str(proto).map_err(|_| PortMapperError::UnknownAddressType)?;
        let socket = SocketAddr::from_str(socket)
            .map_err(|_| PortMapperError::InvalidAddress(s.to_string()))?;
        Ok(TransportAddr::new(proto, socket.ip(), socket.port()))
    }
}

/// Canonical identity of a mapping: host IP, host port and protocol, as `<ip>:<port>/<proto>`.
///
/// The IP is rendered with its standard textual form (RFC 5952 for IPv6), without brackets. Two
/// addresses map to the same key if and only if they have the same numeric IP, port and protocol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingKey(String);

impl MappingKey {
    #[must_use]
    pub fn new(ip: IpAddr, port: u16, proto: Protocol) -> Self {
        Self(format!("{ip}:{port}/{proto}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MappingKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
