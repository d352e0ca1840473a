// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Placeholder relay used when the userland proxy is disabled. It forwards nothing, but holds the
//! host port open so that no other process on the host can take it.

use super::{Relay, RelayError, RelayFactory, RelaySpec};
use portalloc::Protocol;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct DummyProxyFactory;

impl RelayFactory for DummyProxyFactory {
    fn new_relay(&self, spec: &RelaySpec) -> Result<Box<dyn Relay>, RelayError> {
        Ok(Box::new(DummyProxy::new(spec)))
    }
}

#[derive(Debug)]
enum Holder {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

#[derive(Debug)]
pub struct DummyProxy {
    proto: Protocol,
    addr: SocketAddr,
    holder: Option<Holder>,
}

impl DummyProxy {
    #[must_use]
    pub fn new(spec: &RelaySpec) -> Self {
        Self {
            proto: spec.proto,
            addr: SocketAddr::new(spec.host_ip, spec.host_port),
            holder: None,
        }
    }

    /// Whether the host port is currently held.
    #[must_use]
    pub fn is_holding(&self) -> bool {
        self.holder.is_some()
    }
}

impl Relay for DummyProxy {
    fn start(&mut self) -> Result<(), RelayError> {
        if self.holder.is_some() {
            return Ok(());
        }
        let bind_err = |source| RelayError::Bind {
            addr: self.addr.to_string(),
            source,
        };
        self.holder = match self.proto {
            Protocol::Tcp => Some(Holder::Tcp(TcpListener::bind(self.addr).map_err(bind_err)?)),
            Protocol::Udp => Some(Holder::Udp(UdpSocket::bind(self.addr).map_err(bind_err)?)),
            // No portable way to hold an SCTP port
            Protocol::Sctp => None,
        };
        debug!("Holding {}/{}", self.addr, self.proto);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RelayError> {
        if self.holder.take().is_some() {
            debug!("Released {}/{}", self.addr, self.proto);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn spec(proto: Protocol, port: u16) -> RelaySpec {
        RelaySpec {
            proto,
            host_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            host_port: port,
            container_ip: IpAddr::V4(Ipv4Addr::new(172, 17, 0, 2)),
            container_port: 80,
        }
    }

    #[test]
    fn test_tcp_holds_port() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        // Port in use: start fails
        let mut proxy = DummyProxy::new(&spec(Protocol::Tcp, port));
        assert!(matches!(proxy.start(), Err(RelayError::Bind { .. })));
        assert!(!proxy.is_holding());

        drop(taken);
        proxy.start().unwrap();
        assert!(proxy.is_holding());
        assert!(TcpListener::bind(("127.0.0.1", port)).is_err());

        proxy.stop().unwrap();
        assert!(!proxy.is_holding());
        proxy.stop().unwrap();
    }

    #[test]
    fn test_udp_holds_port() {
        let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let mut proxy = DummyProxy::new(&spec(Protocol::Udp, port));
        assert!(proxy.start().is_err());
        drop(taken);
        proxy.start().unwrap();
        assert!(UdpSocket::bind(("127.0.0.1", port)).is_err());
        proxy.stop().unwrap();
    }

    #[test]
    fn test_sctp_is_noop() {
        let mut relay = DummyProxyFactory.new_relay(&spec(Protocol::Sctp, 9)).unwrap();
        relay.start().unwrap();
        relay.stop().unwrap();
    }
}
