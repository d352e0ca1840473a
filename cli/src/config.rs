// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Run configuration: a YAML file, overridden by command line arguments.

use crate::args::CmdArgs;
use mapper::{BridgeName, IllegalBridgeName, PortMapperConfig, TransportAddr};
use portalloc::{PortRange, PortRangeError, Protocol};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml_ng::Error),
    #[error("invalid mapping '{spec}': {reason}")]
    InvalidMapping { spec: String, reason: String },
    #[error(transparent)]
    Bridge(#[from] IllegalBridgeName),
    #[error("malformed port range '{0}', expected START-END")]
    MalformedPortRange(String),
    #[error(transparent)]
    PortRange(#[from] PortRangeError),
}

/// Content of the configuration file.
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileConfig {
    #[serde(default)]
    pub(crate) mapper: PortMapperConfig,
    #[serde(default)]
    pub(crate) userland_proxy: bool,
    #[serde(default)]
    pub(crate) mappings: Vec<String>,
    #[serde(default)]
    pub(crate) remap_interval: Option<u64>,
    #[serde(default)]
    pub(crate) log: Option<String>,
}

impl FileConfig {
    pub(crate) fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml_ng::from_str(&content)?)
    }
}

/// A port mapping requested by the user.
///
/// Syntax: `[host_ip:]host_port[-host_port_end]:container_ip:container_port[/proto][,v6=ipv6]`.
/// IPv6 addresses before the protocol must be written in brackets. The protocol defaults to
/// `tcp`, and a host port of 0 picks any port of the dynamic range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MappingSpec {
    pub(crate) host_ip: Option<IpAddr>,
    pub(crate) host_start: u16,
    pub(crate) host_end: u16,
    pub(crate) container: TransportAddr,
    pub(crate) container_v6: Option<TransportAddr>,
}

/// Split on ':' outside of brackets.
fn split_fields(s: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut depth = 0usize;
    let mut begin = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => {
                fields.push(&s[begin..i]);
                begin = i + 1;
            }
            _ => {}
        }
    }
    fields.push(&s[begin..]);
    fields
}

fn parse_ip(s: &str) -> Option<IpAddr> {
    let s = s
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(s);
    s.parse().ok()
}

fn parse_host_ports(s: &str) -> Option<(u16, u16)> {
    match s.split_once('-') {
        None => {
            let port = s.parse().ok()?;
            Some((port, port))
        }
        Some((start, end)) => {
            let (start, end) = (start.parse().ok()?, end.parse().ok()?);
            (start <= end && start != 0).then_some((start, end))
        }
    }
}

impl FromStr for MappingSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidMapping {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let (main, v6) = match s.split_once(",v6=") {
            Some((main, v6)) => (main, Some(v6)),
            None => (s, None),
        };
        let (main, proto) = match main.rsplit_once('/') {
            Some((main, proto)) => (
                main,
                Protocol::from_str(proto).map_err(|e| invalid(&e.to_string()))?,
            ),
            None => (main, Protocol::Tcp),
        };

        let (host_ip, host_ports, container_ip, container_port) = match split_fields(main)[..] {
            [ports, ip, port] => (None, ports, ip, port),
            [host_ip, ports, ip, port] => {
                let host_ip = parse_ip(host_ip).ok_or_else(|| invalid("bad host address"))?;
                (Some(host_ip), ports, ip, port)
            }
            _ => {
                return Err(invalid(
                    "expected [host_ip:]host_port:container_ip:container_port",
                ));
            }
        };

        let (host_start, host_end) =
            parse_host_ports(host_ports).ok_or_else(|| invalid("bad host port"))?;
        let container_ip = parse_ip(container_ip).ok_or_else(|| invalid("bad container address"))?;
        let container_port = match container_port.parse::<u16>() {
            Ok(0) | Err(_) => return Err(invalid("bad container port")),
            Ok(port) => port,
        };

        let container_v6 = match v6 {
            None => None,
            Some(v6) => match parse_ip(v6) {
                Some(ip @ IpAddr::V6(_)) => Some(TransportAddr::new(proto, ip, container_port)),
                _ => return Err(invalid("bad IPv6 container address")),
            },
        };

        Ok(MappingSpec {
            host_ip,
            host_start,
            host_end,
            container: TransportAddr::new(proto, container_ip, container_port),
            container_v6,
        })
    }
}

fn parse_port_range(s: &str) -> Result<PortRange, ConfigError> {
    let malformed = || ConfigError::MalformedPortRange(s.to_string());
    let (start, end) = s.split_once('-').ok_or_else(malformed)?;
    let start = start.trim().parse().map_err(|_| malformed())?;
    let end = end.trim().parse().map_err(|_| malformed())?;
    Ok(PortRange::new(start, end)?)
}

/// Everything the binary needs to run.
#[derive(Debug)]
pub(crate) struct RunConfig {
    pub(crate) mapper: PortMapperConfig,
    pub(crate) userland_proxy: bool,
    pub(crate) mappings: Vec<MappingSpec>,
    pub(crate) remap_interval: Option<Duration>,
    pub(crate) log: Option<String>,
}

impl RunConfig {
    pub(crate) fn new(args: &CmdArgs) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(file, args)
    }

    /// Command line values win over the ones from the file. Mappings from both are kept, file
    /// first.
    pub(crate) fn merge(file: FileConfig, args: &CmdArgs) -> Result<Self, ConfigError> {
        let mut mapper = file.mapper;
        if let Some(path) = &args.proxy_path {
            mapper.proxy_path = Some(path.clone());
        }
        if let Some(bridge) = &args.bridge {
            mapper.bridge = Some(BridgeName::try_from(bridge.as_str())?);
        }
        if let Some(chain) = &args.chain {
            mapper.chain.clone_from(chain);
        }
        if let Some(iptables) = args.iptables {
            mapper.iptables = iptables;
        }
        if let Some(ip6tables) = args.ip6tables {
            mapper.ip6tables = ip6tables;
        }
        mapper.hairpin |= args.hairpin;
        if let Some(range) = &args.port_range {
            mapper.port_range = Some(parse_port_range(range)?);
        }

        let mappings = file
            .mappings
            .iter()
            .chain(args.maps.iter())
            .map(|spec| spec.parse())
            .collect::<Result<Vec<MappingSpec>, _>>()?;

        Ok(RunConfig {
            mapper,
            userland_proxy: file.userland_proxy || args.userland_proxy,
            mappings,
            remap_interval: args
                .remap_interval
                .or(file.remap_interval)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            log: args.log.clone().or(file.log),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn spec(s: &str) -> MappingSpec {
        s.parse().unwrap()
    }

    #[test]
    fn test_mapping_spec_short() {
        assert_eq!(
            spec("8080:172.17.0.2:80"),
            MappingSpec {
                host_ip: None,
                host_start: 8080,
                host_end: 8080,
                container: TransportAddr::new(
                    Protocol::Tcp,
                    IpAddr::V4(Ipv4Addr::new(172, 17, 0, 2)),
                    80
                ),
                container_v6: None,
            }
        );
    }

    #[test]
    fn test_mapping_spec_full() {
        let parsed = spec("[::1]:8000-8010:[fd00::2]:53/udp");
        assert_eq!(parsed.host_ip, Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!((parsed.host_start, parsed.host_end), (8000, 8010));
        assert_eq!(parsed.container.to_string(), "[fd00::2]:53/udp");

        let parsed = spec("127.0.0.1:0:172.17.0.2:9000/sctp,v6=fd00::2");
        assert_eq!(parsed.host_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!((parsed.host_start, parsed.host_end), (0, 0));
        assert_eq!(parsed.container.protocol(), Protocol::Sctp);
        assert_eq!(
            parsed.container_v6.unwrap().to_string(),
            "[fd00::2]:9000/sctp"
        );
    }

    #[test]
    fn test_mapping_spec_invalid() {
        for bad in [
            "",
            "8080",
            "8080:172.17.0.2",
            "8080:172.17.0.2:80/icmp",
            "8080:172.17.0.2:0",
            "9000-8000:172.17.0.2:80",
            "0-10:172.17.0.2:80",
            "70000:172.17.0.2:80",
            "8080:not-an-ip:80",
            "host:8080:172.17.0.2:80",
            "8080:172.17.0.2:80,v6=172.17.0.3",
            "1:2:3:4:5",
        ] {
            assert!(
                matches!(
                    bad.parse::<MappingSpec>(),
                    Err(ConfigError::InvalidMapping { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_file_config() {
        let yaml = r"
mapper:
  bridge: docker0
  ip6tables: true
userland_proxy: true
mappings:
  - 8080:172.17.0.2:80
remap_interval: 60
";
        let file: FileConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(file.mapper.bridge.as_ref().unwrap().as_str(), "docker0");
        assert!(file.mapper.iptables);
        assert!(file.userland_proxy);
        assert_eq!(file.mappings, vec!["8080:172.17.0.2:80".to_string()]);
        assert_eq!(file.remap_interval, Some(60));

        assert_eq!(
            serde_yaml_ng::from_str::<FileConfig>("{}").unwrap(),
            FileConfig::default()
        );
        assert!(serde_yaml_ng::from_str::<FileConfig>("unknown: 1").is_err());
    }

    #[test]
    fn test_merge_overrides() {
        let file = FileConfig {
            mapper: PortMapperConfig {
                chain: "FROMFILE".to_string(),
                ..PortMapperConfig::default()
            },
            mappings: vec!["8080:172.17.0.2:80".to_string()],
            remap_interval: Some(10),
            log: Some("debug".to_string()),
            ..FileConfig::default()
        };
        let args = CmdArgs {
            maps: vec!["53:172.17.0.2:53/udp".to_string()],
            chain: Some("FROMARGS".to_string()),
            bridge: Some("br0".to_string()),
            iptables: Some(false),
            port_range: Some("20000-20010".to_string()),
            remap_interval: Some(0),
            ..CmdArgs::default()
        };
        let config = RunConfig::merge(file, &args).unwrap();
        assert_eq!(config.mapper.chain, "FROMARGS");
        assert_eq!(config.mapper.bridge.unwrap().as_str(), "br0");
        assert!(!config.mapper.iptables);
        assert_eq!(config.mapper.port_range.unwrap().start(), 20000);
        assert_eq!(config.mappings.len(), 2);
        assert_eq!(config.mappings[0].host_start, 8080);
        assert_eq!(config.mappings[1].container.protocol(), Protocol::Udp);
        assert_eq!(config.remap_interval, None);
        assert_eq!(config.log.as_deref(), Some("debug"));
    }

    #[test]
    fn test_merge_errors() {
        let bad_bridge = CmdArgs {
            bridge: Some("not a bridge".to_string()),
            ..CmdArgs::default()
        };
        assert!(matches!(
            RunConfig::merge(FileConfig::default(), &bad_bridge),
            Err(ConfigError::Bridge(_))
        ));

        let bad_range = CmdArgs {
            port_range: Some("20000".to_string()),
            ..CmdArgs::default()
        };
        assert!(matches!(
            RunConfig::merge(FileConfig::default(), &bad_range),
            Err(ConfigError::MalformedPortRange(_))
        ));

        let inverted = CmdArgs {
            port_range: Some("20010-20000".to_string()),
            ..CmdArgs::default()
        };
        assert!(matches!(
            RunConfig::merge(FileConfig::default(), &inverted),
            Err(ConfigError::PortRange(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            FileConfig::load(Path::new("/nonexistent/portmap.yaml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
