// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![deny(rustdoc::all)]

//! Host port allocator for container port mappings
//!
//! The [`PortAllocator`] keeps track of which `(IP address, protocol, port)` tuples are reserved on
//! the host. It does not query the operating system: a port is "free" if this allocator has not
//! handed it out.
//!
//! Ports are requested either exactly (`start == end`), or anywhere in a range, in which case the
//! allocator scans the range starting right after the last port it handed out for that range, so
//! that recently released ports are not immediately reused.
//!
//! # Example
//!
//! ```
//! use portmap_portalloc::{PortAllocator, PortRange, Protocol};
//!
//! let allocator = PortAllocator::with_default_range(PortRange::new(5000, 5010).unwrap());
//! let port = allocator.request_port_in_range(None, Protocol::Tcp, 0, 0).unwrap();
//! assert_eq!(port, 5000);
//! allocator.release_port(None, Protocol::Tcp, port).unwrap();
//! ```

mod range;

pub use range::{
    DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START, PortRange, PortRangeError,
    dynamic_port_range,
};

#[cfg(not(feature = "shuttle"))]
use std::sync::Mutex;

#[cfg(feature = "shuttle")]
use shuttle::sync::Mutex;

use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::PoisonError;
use tracing::debug;

/// Address used when the caller does not specify one.
pub const DEFAULT_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Transport protocol of a port reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PortAllocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            _ => Err(PortAllocatorError::UnknownProtocol(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortAllocatorError {
    #[error("all ports are allocated")]
    AllPortsAllocated,
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error("bind for {ip}:{port} failed: port is already allocated")]
    PortAlreadyAllocated { ip: IpAddr, port: u16 },
    #[error("invalid port range {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },
    #[error("port {ip}:{port}/{proto} is not allocated")]
    PortNotAllocated {
        ip: IpAddr,
        proto: Protocol,
        port: u16,
    },
}

/// Number of range cursors kept per (IP address, protocol) before stale ones are dropped.
const MAX_RANGE_CURSORS: usize = 16;

/// Reserved ports for a given (IP address, protocol) pair. Dropped with its cursors once its last
/// port is released.
#[derive(Debug, Default)]
struct PortMap {
    ports: BTreeSet<u16>,
    // Last port handed out, per requested range
    cursors: HashMap<PortRange, u16>,
}

impl PortMap {
    fn reserve_exact(&mut self, ip: IpAddr, port: u16) -> Result<u16, PortAllocatorError> {
        if !self.ports.insert(port) {
            return Err(PortAllocatorError::PortAlreadyAllocated { ip, port });
        }
        Ok(port)
    }

    fn reserve_in_range(&mut self, range: PortRange) -> Result<u16, PortAllocatorError> {
        let cursor = self.cursors.get(&range).copied().unwrap_or(range.end());
        let port = range
            .cycle_after(cursor)
            .find(|port| !self.ports.contains(port))
            .ok_or(PortAllocatorError::AllPortsAllocated)?;
        self.ports.insert(port);
        self.cursors.insert(range, port);
        if self.cursors.len() > MAX_RANGE_CURSORS {
            // forget ranges with no live reservation
            let ports = &self.ports;
            self.cursors
                .retain(|r, _| *r == range || ports.range(r.start()..=r.end()).next().is_some());
        }
        Ok(port)
    }
}

#[derive(Debug, Default)]
struct AllocatorState {
    ips: HashMap<IpAddr, HashMap<Protocol, PortMap>>,
}

/// Thread-safe host port allocator.
#[derive(Debug)]
pub struct PortAllocator {
    default_range: PortRange,
    state: Mutex<AllocatorState>,
}

impl PortAllocator {
    /// Create an allocator whose default range is the kernel's dynamic port range.
    #[must_use]
    pub fn new() -> Self {
        Self::with_default_range(dynamic_port_range())
    }

    /// Create an allocator with an explicit default range, used when no range is requested.
    #[must_use]
    pub fn with_default_range(default_range: PortRange) -> Self {
        Self {
            default_range,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    #[must_use]
    pub fn default_range(&self) -> PortRange {
        self.default_range
    }

    fn lock(&self) -> impl std::ops::DerefMut<Target = AllocatorState> + '_ {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request a specific port, or any port from the default range if `port` is 0.
    ///
    /// # Errors
    ///
    /// See [`PortAllocator::request_port_in_range`].
    pub fn request_port(
        &self,
        ip: Option<IpAddr>,
        proto: Protocol,
        port: u16,
    ) -> Result<u16, PortAllocatorError> {
        self.request_port_in_range(ip, proto, port, port)
    }

    /// Reserve a port for `(ip, proto)`.
    ///
    /// - `start == end == 0`: any free port from the default range
    /// - `start == end`: exactly this port
    /// - otherwise: any free port in `start..=end`
    ///
    /// # Errors
    ///
    /// - [`PortAllocatorError::PortAlreadyAllocated`] if an exact port is already reserved
    /// - [`PortAllocatorError::InvalidPortRange`] if the range is empty or starts at 0
    /// - [`PortAllocatorError::AllPortsAllocated`] if no port of the range is free
    pub fn request_port_in_range(
        &self,
        ip: Option<IpAddr>,
        proto: Protocol,
        start: u16,
        end: u16,
    ) -> Result<u16, PortAllocatorError> {
        let ip = ip.unwrap_or(DEFAULT_IP);
        let mut state = self.lock();
        let portmap = state
            .ips
            .entry(ip)
            .or_default()
            .entry(proto)
            .or_default();

        let port = if start != 0 && start == end {
            portmap.reserve_exact(ip, start)?
        } else {
            let range = if start == 0 && end == 0 {
                self.default_range
            } else {
                PortRange::new(start, end)
                    .map_err(|_| PortAllocatorError::InvalidPortRange { start, end })?
            };
            portmap.reserve_in_range(range)?
        };
        debug!("Allocated port {ip}:{port}/{proto}");
        Ok(port)
    }

    /// Release a port previously reserved for `(ip, proto)`.
    ///
    /// # Errors
    ///
    /// Returns [`PortAllocatorError::PortNotAllocated`] if the port was not reserved.
    pub fn release_port(
        &self,
        ip: Option<IpAddr>,
        proto: Protocol,
        port: u16,
    ) -> Result<(), PortAllocatorError> {
        let ip = ip.unwrap_or(DEFAULT_IP);
        let mut state = self.lock();
        let Some(protos) = state.ips.get_mut(&ip) else {
            return Err(PortAllocatorError::PortNotAllocated { ip, proto, port });
        };
        let released = protos
            .get_mut(&proto)
            .is_some_and(|portmap| portmap.ports.remove(&port));
        if !released {
            return Err(PortAllocatorError::PortNotAllocated { ip, proto, port });
        }
        protos.retain(|_, portmap| !portmap.ports.is_empty());
        if protos.is_empty() {
            state.ips.remove(&ip);
        }
        debug!("Released port {ip}:{port}/{proto}");
        Ok(())
    }

    /// Drop every reservation.
    pub fn release_all(&self) {
        self.lock().ips.clear();
        debug!("Released all ports");
    }

    #[must_use]
    pub fn is_allocated(&self, ip: Option<IpAddr>, proto: Protocol, port: u16) -> bool {
        let ip = ip.unwrap_or(DEFAULT_IP);
        self.lock()
            .ips
            .get(&ip)
            .and_then(|protos| protos.get(&proto))
            .is_some_and(|portmap| portmap.ports.contains(&port))
    }

    /// Total number of reservations, across all addresses and protocols
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.lock()
            .ips
            .values()
            .flat_map(HashMap::values)
            .map(|portmap| portmap.ports.len())
            .sum()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}
