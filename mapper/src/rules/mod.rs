// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Kernel forwarding rules (DNAT and friends) attached to a mapping.

mod iptables;

pub use iptables::{CommandOutput, CommandRunner, IptablesChain, SystemCommandRunner, Table};

use portalloc::Protocol;
use std::fmt::{Debug, Display, Formatter};
use std::net::IpAddr;

/// What to do with a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Append,
    Insert,
    Delete,
}

impl Action {
    /// The `iptables` flag for this action.
    #[must_use]
    pub fn as_flag(self) -> &'static str {
        match self {
            Action::Append => "-A",
            Action::Insert => "-I",
            Action::Delete => "-D",
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Append => f.write_str("append"),
            Action::Insert => f.write_str("insert"),
            Action::Delete => f.write_str("delete"),
        }
    }
}

/// IP family of a rule set: `iptables` or `ip6tables`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    #[must_use]
    pub fn program(self) -> &'static str {
        match self {
            IpVersion::V4 => "iptables",
            IpVersion::V6 => "ip6tables",
        }
    }

    /// The address matching anything in this family, in `iptables` notation.
    #[must_use]
    pub fn any(self) -> &'static str {
        match self {
            IpVersion::V4 => "0/0",
            IpVersion::V6 => "::/0",
        }
    }
}

impl Display for IpVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

/// Name of the bridge the containers are attached to, checked to be a legal linux interface
/// name: at most 15 bytes of alphanumeric ASCII, `.`, `-` and `_`.
#[repr(transparent)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct BridgeName(String);

impl BridgeName {
    /// Longest legal name, not counting the trailing NUL.
    pub const MAX_LEN: usize = 15;

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IllegalBridgeName {
    #[error("bridge name must not be empty")]
    Empty,
    #[error("bridge name must not be . or ..")]
    Dots,
    #[error("bridge name {0} is longer than {max} bytes", max = BridgeName::MAX_LEN)]
    TooLong(String),
    #[error(
        "bridge name {0} contains illegal characters (only alphanumeric ASCII and .-_ are permitted)"
    )]
    IllegalCharacters(String),
}

impl TryFrom<String> for BridgeName {
    type Error = IllegalBridgeName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        const LEGAL_PUNCT: [char; 3] = ['.', '-', '_'];
        if value.is_empty() {
            return Err(IllegalBridgeName::Empty);
        }
        if value == "." || value == ".." {
            return Err(IllegalBridgeName::Dots);
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || LEGAL_PUNCT.contains(&c))
        {
            return Err(IllegalBridgeName::IllegalCharacters(value));
        }
        if value.len() > BridgeName::MAX_LEN {
            return Err(IllegalBridgeName::TooLong(value));
        }
        Ok(BridgeName(value))
    }
}

impl TryFrom<&str> for BridgeName {
    type Error = IllegalBridgeName;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl From<BridgeName> for String {
    fn from(value: BridgeName) -> Self {
        value.0
    }
}

impl AsRef<str> for BridgeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for BridgeName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A forwarding rule: traffic for `source_ip:source_port` is sent to `dest_ip:dest_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub proto: Protocol,
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub dest_ip: IpAddr,
    pub dest_port: u16,
    pub bridge: Option<BridgeName>,
}

impl Display for ForwardRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let source = std::net::SocketAddr::new(self.source_ip, self.source_port);
        let dest = std::net::SocketAddr::new(self.dest_ip, self.dest_port);
        write!(f, "{source} -> {dest}/{}", self.proto)?;
        if let Some(bridge) = &self.bridge {
            write!(f, " via {bridge}")?;
        }
        Ok(())
    }
}

/// Installs and removes forwarding rules for one IP family.
pub trait RuleInstaller: Debug + Send + Sync {
    /// Apply `action` to the rules forwarding traffic as described by `rule`.
    ///
    /// # Errors
    ///
    /// Fails if the rules cannot be programmed.
    fn forward(&self, action: Action, rule: &ForwardRule) -> Result<(), RuleError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} {} failed (status {status:?}): {stderr}", .args.join(" "))]
    Failed {
        program: String,
        args: Vec<String>,
        status: Option<i32>,
        stderr: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_name() {
        assert_eq!(BridgeName::try_from("docker0").unwrap().as_str(), "docker0");
        assert_eq!(
            BridgeName::try_from("br-0a1b_2.c").unwrap().to_string(),
            "br-0a1b_2.c"
        );
        assert_eq!(BridgeName::try_from(""), Err(IllegalBridgeName::Empty));
        assert_eq!(BridgeName::try_from(".."), Err(IllegalBridgeName::Dots));
        assert!(matches!(
            BridgeName::try_from("0123456789abcdef"),
            Err(IllegalBridgeName::TooLong(_))
        ));
        assert!(BridgeName::try_from("0123456789abcde").is_ok());
        assert!(matches!(
            BridgeName::try_from("br 0"),
            Err(IllegalBridgeName::IllegalCharacters(_))
        ));
        assert!(matches!(
            BridgeName::try_from("brü"),
            Err(IllegalBridgeName::IllegalCharacters(_))
        ));
    }

    #[test]
    fn test_action_flags() {
        assert_eq!(Action::Append.as_flag(), "-A");
        assert_eq!(Action::Insert.as_flag(), "-I");
        assert_eq!(Action::Delete.as_flag(), "-D");
    }
}
