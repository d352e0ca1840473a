// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Port mapper configuration

use crate::rules::BridgeName;
use derive_builder::Builder;
use portalloc::PortRange;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;

/// Default name of the user-defined chains holding the forwarding rules.
pub const DEFAULT_CHAIN: &str = "PORTMAP";

fn default_chain() -> String {
    DEFAULT_CHAIN.to_string()
}

fn default_true() -> bool {
    true
}

/// Configuration of a [`PortMapper`](crate::PortMapper). N.B. we derive a builder type
/// `PortMapperConfigBuilder`, with defaults for each field.
#[derive(Builder, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PortMapperConfig {
    /// Userland proxy binary; looked up in `PATH` when unset.
    #[builder(setter(into, strip_option), default)]
    #[serde(default)]
    pub proxy_path: Option<PathBuf>,

    /// Bridge the containers are attached to.
    #[builder(setter(strip_option), default)]
    #[serde(default)]
    pub bridge: Option<BridgeName>,

    #[builder(setter(into), default = DEFAULT_CHAIN.to_string())]
    #[serde(default = "default_chain")]
    pub chain: String,

    /// Program IPv4 forwarding rules.
    #[builder(default = true)]
    #[serde(default = "default_true")]
    pub iptables: bool,

    /// Program IPv6 forwarding rules.
    #[builder(default = false)]
    #[serde(default)]
    pub ip6tables: bool,

    /// Let containers reach each other through mapped host ports.
    #[builder(default = false)]
    #[serde(default)]
    pub hairpin: bool,

    /// Range used for dynamic host ports; the kernel's dynamic range when unset.
    #[builder(setter(strip_option), default)]
    #[serde(default)]
    pub port_range: Option<PortRange>,
}

impl Default for PortMapperConfig {
    fn default() -> Self {
        Self {
            proxy_path: None,
            bridge: None,
            chain: default_chain(),
            iptables: true,
            ip6tables: false,
            hairpin: false,
            port_range: None,
        }
    }
}

impl Display for PortMapperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Port mapper config")?;
        match &self.proxy_path {
            Some(path) => writeln!(f, "  proxy     : {}", path.display())?,
            None => writeln!(f, "  proxy     : (from PATH)")?,
        }
        match &self.bridge {
            Some(bridge) => writeln!(f, "  bridge    : {bridge}")?,
            None => writeln!(f, "  bridge    : (none)")?,
        }
        writeln!(f, "  chain     : {}", self.chain)?;
        writeln!(f, "  iptables  : {}", self.iptables)?;
        writeln!(f, "  ip6tables : {}", self.ip6tables)?;
        writeln!(f, "  hairpin   : {}", self.hairpin)?;
        match &self.port_range {
            Some(range) => writeln!(f, "  ports     : {range}"),
            None => writeln!(f, "  ports     : (dynamic)"),
        }
    }
}
