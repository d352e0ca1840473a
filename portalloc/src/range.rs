// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Port ranges, and discovery of the kernel's dynamic (ephemeral) port range.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::num::ParseIntError;
use tracing::warn;

/// First port of the fallback dynamic range, used when the kernel range cannot be read.
pub const DEFAULT_PORT_RANGE_START: u16 = 49153;
/// Last port of the fallback dynamic range.
pub const DEFAULT_PORT_RANGE_END: u16 = 65535;

const PORT_RANGE_FILE: &str = "/proc/sys/net/ipv4/ip_local_port_range";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortRangeError {
    #[error("invalid port range {start}-{end}")]
    Invalid { start: u16, end: u16 },
    #[error("malformed port range '{0}'")]
    Malformed(String),
    #[error("bad port number: {0}")]
    BadNumber(#[from] ParseIntError),
}

/// An inclusive range of transport ports. A valid range never contains port 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPortRange", into = "RawPortRange")]
pub struct PortRange {
    start: u16,
    end: u16,
}

#[derive(Serialize, Deserialize)]
struct RawPortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Build a [`PortRange`].
    ///
    /// # Errors
    ///
    /// Fails if `start` is zero or greater than `end`.
    pub fn new(start: u16, end: u16) -> Result<Self, PortRangeError> {
        if start == 0 || start > end {
            return Err(PortRangeError::Invalid { start, end });
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn start(&self) -> u16 {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> u16 {
        self.end
    }

    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Number of ports in the range
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate over the ports of the range, starting right after `cursor` and wrapping around once.
    /// Each port of the range is yielded exactly once.
    pub(crate) fn cycle_after(&self, cursor: u16) -> impl Iterator<Item = u16> + use<> {
        let first = if cursor >= self.end || cursor < self.start {
            self.start
        } else {
            cursor + 1
        };
        (first..=self.end).chain(self.start..first)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_RANGE_START,
            end: DEFAULT_PORT_RANGE_END,
        }
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl TryFrom<RawPortRange> for PortRange {
    type Error = PortRangeError;

    fn try_from(raw: RawPortRange) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
    }
}

impl From<PortRange> for RawPortRange {
    fn from(range: PortRange) -> Self {
        Self {
            start: range.start,
            end: range.end,
        }
    }
}

/// Parse the content of `ip_local_port_range`: two integers separated by whitespace.
pub(crate) fn parse_port_range(content: &str) -> Result<PortRange, PortRangeError> {
    let mut fields = content.split_whitespace();
    let (Some(start), Some(end), None) = (fields.next(), fields.next(), fields.next()) else {
        return Err(PortRangeError::Malformed(content.trim().to_string()));
    };
    PortRange::new(start.parse()?, end.parse()?)
}

/// The kernel's dynamic port range, or the fallback range if it cannot be read.
#[must_use]
pub fn dynamic_port_range() -> PortRange {
    let content = match std::fs::read_to_string(PORT_RANGE_FILE) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read {PORT_RANGE_FILE}: {e}, using default range");
            return PortRange::default();
        }
    };
    parse_port_range(&content).unwrap_or_else(|e| {
        warn!("Failed to parse {PORT_RANGE_FILE}: {e}, using default range");
        PortRange::default()
    })
}
