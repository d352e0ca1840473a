// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::addr::TransportAddr;
use crate::relay::Relay;
use crate::rules::BridgeName;
use portalloc::Protocol;

/// An active port mapping: a host address bound to a container address, along with the relay
/// process serving it. The mapping owns its relay; dropping the mapping drops the relay.
#[derive(Debug)]
pub struct Mapping {
    proto: Protocol,
    host: TransportAddr,
    container: TransportAddr,
    container_v6: Option<TransportAddr>,
    // bridge the forwarding rules were installed with
    bridge: Option<BridgeName>,
    relay: Box<dyn Relay>,
}

impl Mapping {
    pub(crate) fn new(
        host: TransportAddr,
        container: TransportAddr,
        container_v6: Option<TransportAddr>,
        bridge: Option<BridgeName>,
        relay: Box<dyn Relay>,
    ) -> Self {
        Self {
            proto: host.protocol(),
            host,
            container,
            container_v6,
            bridge,
            relay,
        }
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.proto
    }

    /// Host side of the mapping, always a single-IP address.
    #[must_use]
    pub fn host(&self) -> &TransportAddr {
        &self.host
    }

    /// Container address the relay forwards to.
    #[must_use]
    pub fn container(&self) -> &TransportAddr {
        &self.container
    }

    /// Container address for the IPv4 path: the container address, if its IP is an IPv4 address
    /// (possibly IPv4-mapped).
    #[must_use]
    pub fn container_v4(&self) -> Option<&TransportAddr> {
        self.container
            .ip()
            .filter(|ip| ip.to_canonical().is_ipv4())
            .map(|_| &self.container)
    }

    #[must_use]
    pub fn container_v6(&self) -> Option<&TransportAddr> {
        self.container_v6.as_ref()
    }

    /// Bridge named in the forwarding rules of this mapping.
    #[must_use]
    pub fn bridge(&self) -> Option<&BridgeName> {
        self.bridge.as_ref()
    }

    pub(crate) fn relay_mut(&mut self) -> &mut dyn Relay {
        self.relay.as_mut()
    }
}
