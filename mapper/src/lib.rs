// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![deny(rustdoc::all)]

//! Container port mapping
//!
//! The [`PortMapper`] binds host ports to container addresses. A mapping is made of:
//!
//! - a host port, reserved with a [`portalloc::PortAllocator`],
//! - forwarding rules, installed through a [`RuleInstaller`] for each IP family,
//! - a [`Relay`]: the userland proxy, or a placeholder holding the host port,
//! - an entry in the [`MappingRegistry`], keyed by the host address.
//!
//! All of these are set up and torn down together: a mapping that fails half-way leaves nothing
//! behind.
//!
//! # Example
//!
//! ```no_run
//! use portmap_mapper::{PortMapper, TransportAddr};
//! use std::str::FromStr;
//!
//! let mapper = PortMapper::new(None);
//! let container = TransportAddr::from_str("172.17.0.2:80/tcp").unwrap();
//! let host = mapper.map(&container, None, None, 8080, false).unwrap();
//! assert_eq!(host.to_string(), "0.0.0.0:8080/tcp");
//! mapper.unmap(&host).unwrap();
//! ```

mod addr;
mod config;
mod error;
mod mapper;
mod mapping;
mod registry;
mod relay;
mod rollback;
mod rules;
mod sync;

pub use addr::{MappingKey, SctpAddr, TransportAddr};
pub use config::{DEFAULT_CHAIN, PortMapperConfig, PortMapperConfigBuilder};
pub use error::PortMapperError;
pub use mapper::PortMapper;
pub use mapping::Mapping;
pub use registry::MappingRegistry;
pub use relay::{
    DummyProxy, DummyProxyFactory, PROXY_COMMAND_NAME, PROXY_START_TIMEOUT, ProxyCommand,
    ProxyCommandFactory, Relay, RelayError, RelayFactory, RelaySpec,
};
pub use rules::{
    Action, BridgeName, CommandOutput, CommandRunner, ForwardRule, IllegalBridgeName, IpVersion,
    IptablesChain, RuleError, RuleInstaller, SystemCommandRunner, Table,
};

pub use portalloc;
