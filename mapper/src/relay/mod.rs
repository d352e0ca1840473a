// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Relay processes, forwarding traffic between a host socket and a container socket.
//!
//! Two flavours exist: the userland proxy ([`ProxyCommand`]), a separate process doing the actual
//! forwarding, and the [`DummyProxy`], which does no forwarding at all and is used when the
//! kernel's NAT rules are enough.

mod dummy;
mod proxy;

pub use dummy::{DummyProxy, DummyProxyFactory};
pub use proxy::{PROXY_COMMAND_NAME, PROXY_START_TIMEOUT, ProxyCommand, ProxyCommandFactory};

use crate::PortMapperError;
use crate::addr::TransportAddr;
use portalloc::Protocol;
use std::fmt::Debug;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("userland proxy binary '{0}' not found")]
    ProxyNotFound(String),
    #[error("failed to spawn userland proxy: {0}")]
    Spawn(std::io::Error),
    #[error("failed to create status pipe: {0}")]
    Pipe(nix::Error),
    #[error("failed to pass status pipe to userland proxy")]
    FdMapping,
    #[error("failed to start status reader: {0}")]
    Thread(std::io::Error),
    #[error("timed out starting the userland proxy (after {0:?})")]
    StartTimeout(Duration),
    #[error("error starting userland proxy: {0}")]
    ProxyFailed(String),
    #[error("failed to signal userland proxy: {0}")]
    Signal(nix::Error),
    #[error("failed to wait for userland proxy: {0}")]
    Wait(std::io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// Everything a relay needs to know about the mapping it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySpec {
    pub proto: Protocol,
    pub host_ip: IpAddr,
    pub host_port: u16,
    pub container_ip: IpAddr,
    pub container_port: u16,
}

impl RelaySpec {
    /// Build the spec from the host address and the container address.
    ///
    /// # Errors
    ///
    /// Fails with [`PortMapperError::SctpAddressMissingIp`] if either address is an SCTP address
    /// with no IP.
    pub fn new(host: &TransportAddr, container: &TransportAddr) -> Result<Self, PortMapperError> {
        let (host_ip, host_port) = host.ip_and_port()?;
        let (container_ip, container_port) = container.ip_and_port()?;
        Ok(Self {
            proto: host.protocol(),
            host_ip,
            host_port,
            container_ip,
            container_port,
        })
    }
}

/// A relay serving one mapping.
pub trait Relay: Debug + Send {
    /// Start forwarding.
    ///
    /// # Errors
    ///
    /// Fails if the relay cannot begin forwarding.
    fn start(&mut self) -> Result<(), RelayError>;

    /// Stop forwarding. Calling this several times, or on a relay that was never started, is
    /// allowed and does nothing.
    ///
    /// # Errors
    ///
    /// Fails if the relay cannot be stopped cleanly.
    fn stop(&mut self) -> Result<(), RelayError>;
}

/// Builds relays. The mapper holds one factory for userland proxies and one for dummy proxies.
pub trait RelayFactory: Debug + Send + Sync {
    /// Build a relay for the given mapping. The relay is not started.
    ///
    /// # Errors
    ///
    /// Fails if the relay cannot be constructed.
    fn new_relay(&self, spec: &RelaySpec) -> Result<Box<dyn Relay>, RelayError>;
}
