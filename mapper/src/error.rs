// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::addr::MappingKey;
use crate::relay::RelayError;
use crate::rules::RuleError;
use portalloc::{PortAllocatorError, Protocol};

#[derive(Debug, thiserror::Error)]
pub enum PortMapperError {
    #[error("unknown container address type not supported")]
    UnknownAddressType,
    #[error("port is already mapped to ip ({0})")]
    PortAlreadyMapped(MappingKey),
    #[error("port is not mapped ({0})")]
    PortNotMapped(MappingKey),
    #[error("sctp address does not contain any IP address")]
    SctpAddressMissingIp,
    #[error("IPv6 container address uses {v6}, but IPv4 container address uses {v4}")]
    ProtocolMismatch { v4: Protocol, v6: Protocol },
    #[error("invalid transport address '{0}'")]
    InvalidAddress(String),
    #[error(transparent)]
    Allocator(#[from] PortAllocatorError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("{cause} (error during port allocation cleanup: {rollback})")]
    Rollback {
        cause: Box<PortMapperError>,
        rollback: Box<PortMapperError>,
    },
}

impl PortMapperError {
    /// The error that triggered a rollback, or the error itself if no rollback failed.
    #[must_use]
    pub fn root_cause(&self) -> &PortMapperError {
        match self {
            PortMapperError::Rollback { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}
