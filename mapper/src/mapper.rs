// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The port mapper: binds host ports to container addresses, keeping the port allocator, the
//! forwarding rules, the relay processes and the mapping registry consistent with each other.

use crate::PortMapperError;
use crate::addr::{MappingKey, TransportAddr};
use crate::config::PortMapperConfig;
use crate::mapping::Mapping;
use crate::registry::MappingRegistry;
use crate::relay::{DummyProxyFactory, ProxyCommandFactory, Relay, RelayFactory, RelaySpec};
use crate::rollback::{Rollback, Undo};
use crate::rules::{Action, BridgeName, ForwardRule, IpVersion, IptablesChain, RuleInstaller};
use crate::sync::{Mutex, MutexGuard, PoisonError};
use portalloc::{DEFAULT_IP, PortAllocator, Protocol};
use std::fmt::Debug;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct MapperState {
    registry: MappingRegistry,
    chain_v4: Option<Arc<dyn RuleInstaller>>,
    chain_v6: Option<Arc<dyn RuleInstaller>>,
    bridge: Option<BridgeName>,
}

impl MapperState {
    fn chain(&self, version: IpVersion) -> Option<&Arc<dyn RuleInstaller>> {
        match version {
            IpVersion::V4 => self.chain_v4.as_ref(),
            IpVersion::V6 => self.chain_v6.as_ref(),
        }
    }

    fn forward_rule(
        host: &TransportAddr,
        container: &TransportAddr,
        bridge: Option<&BridgeName>,
    ) -> Option<ForwardRule> {
        let (source_ip, source_port) = host.ip_and_port().ok()?;
        let (dest_ip, dest_port) = container.ip_and_port().ok()?;
        Some(ForwardRule {
            proto: host.protocol(),
            source_ip,
            source_port,
            dest_ip: dest_ip.to_canonical(),
            dest_port,
            bridge: bridge.cloned(),
        })
    }

    /// The rules a mapping was installed with, bridge included, per IP family it has a container
    /// address in.
    fn mapping_rules(mapping: &Mapping) -> Vec<(IpVersion, ForwardRule)> {
        let rule = |container: &TransportAddr| {
            Self::forward_rule(mapping.host(), container, mapping.bridge())
        };
        let v4 = mapping
            .container_v4()
            .and_then(rule)
            .map(|rule| (IpVersion::V4, rule));
        let v6 = mapping
            .container_v6()
            .and_then(rule)
            .map(|rule| (IpVersion::V6, rule));
        v4.into_iter().chain(v6).collect()
    }
}

/// Manages host port mappings to containers.
///
/// Every operation runs to completion under a single lock, so that the allocator, the rules, the
/// relays and the registry are never observed half-updated. Operations block for as long as the
/// external commands they run.
pub struct PortMapper {
    allocator: Arc<PortAllocator>,
    proxy_factory: Arc<dyn RelayFactory>,
    dummy_factory: Arc<dyn RelayFactory>,
    state: Mutex<MapperState>,
}

impl Debug for PortMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortMapper")
            .field("allocator", &self.allocator)
            .field("proxy_factory", &self.proxy_factory)
            .field("dummy_factory", &self.dummy_factory)
            .finish_non_exhaustive()
    }
}

impl PortMapper {
    /// Create a mapper with its own allocator, running userland proxies from `proxy_path`.
    #[must_use]
    pub fn new(proxy_path: Option<PathBuf>) -> Self {
        Self::with_allocator(Arc::new(PortAllocator::new()), proxy_path)
    }

    /// Create a mapper sharing `allocator`.
    #[must_use]
    pub fn with_allocator(allocator: Arc<PortAllocator>, proxy_path: Option<PathBuf>) -> Self {
        Self::from_parts(
            allocator,
            Arc::new(ProxyCommandFactory::new(proxy_path)),
            Arc::new(DummyProxyFactory),
        )
    }

    /// Create a mapper with explicit relay factories: `proxy_factory` serves mappings requesting a
    /// userland proxy, `dummy_factory` all others.
    #[must_use]
    pub fn from_parts(
        allocator: Arc<PortAllocator>,
        proxy_factory: Arc<dyn RelayFactory>,
        dummy_factory: Arc<dyn RelayFactory>,
    ) -> Self {
        Self {
            allocator,
            proxy_factory,
            dummy_factory,
            state: Mutex::new(MapperState::default()),
        }
    }

    /// Create a mapper from its configuration, setting up the forwarding chains of every enabled
    /// IP family.
    ///
    /// # Errors
    ///
    /// Fails if a chain cannot be created.
    pub fn from_config(config: &PortMapperConfig) -> Result<Self, PortMapperError> {
        let allocator = match config.port_range {
            Some(range) => PortAllocator::with_default_range(range),
            None => PortAllocator::new(),
        };
        let mapper = Self::with_allocator(Arc::new(allocator), config.proxy_path.clone());
        let families = [
            (config.iptables, IpVersion::V4),
            (config.ip6tables, IpVersion::V6),
        ];
        for (enabled, version) in families {
            if !enabled {
                continue;
            }
            let chain = IptablesChain::new(&config.chain, version, config.hairpin);
            chain.ensure_chain(config.bridge.as_ref())?;
            info!("Using {version} chain {}", config.chain);
            mapper.set_chain(version, Some(Arc::new(chain)), config.bridge.clone());
        }
        Ok(mapper)
    }

    fn lock(&self) -> MutexGuard<'_, MapperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_chain(
        &self,
        version: IpVersion,
        chain: Option<Arc<dyn RuleInstaller>>,
        bridge: Option<BridgeName>,
    ) {
        let mut state = self.lock();
        match version {
            IpVersion::V4 => state.chain_v4 = chain,
            IpVersion::V6 => state.chain_v6 = chain,
        }
        state.bridge = bridge;
    }

    /// Set the installer for IPv4 rules (`None` disables them) and the bridge name used in the
    /// rules of both families.
    pub fn set_iptables_chain(
        &self,
        chain: Option<Arc<dyn RuleInstaller>>,
        bridge: Option<BridgeName>,
    ) {
        self.set_chain(IpVersion::V4, chain, bridge);
    }

    /// Set the installer for IPv6 rules (`None` disables them) and the bridge name used in the
    /// rules of both families.
    pub fn set_ip6tables_chain(
        &self,
        chain: Option<Arc<dyn RuleInstaller>>,
        bridge: Option<BridgeName>,
    ) {
        self.set_chain(IpVersion::V6, chain, bridge);
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    /// Map `host_ip:host_port` to `container`; port 0 picks a port from the allocator's default
    /// range.
    ///
    /// # Errors
    ///
    /// See [`PortMapper::map_range`].
    pub fn map(
        &self,
        container: &TransportAddr,
        container_v6: Option<&TransportAddr>,
        host_ip: Option<IpAddr>,
        host_port: u16,
        use_proxy: bool,
    ) -> Result<TransportAddr, PortMapperError> {
        self.map_range(
            container,
            container_v6,
            host_ip,
            host_port,
            host_port,
            use_proxy,
        )
    }

    /// Map a host port to `container` (and to `container_v6` for IPv6 traffic, if given), and
    /// return the host address.
    ///
    /// The host port is `start` if `start == end`, any free port in `start..=end` otherwise, or any
    /// port of the default range if both are 0. `host_ip` defaults to `0.0.0.0`. When `use_proxy` is
    /// set, a userland proxy relays the traffic; otherwise a placeholder holds the host port.
    ///
    /// Either the whole mapping is set up, or nothing is: on failure, every resource acquired so far
    /// is released, newest first.
    ///
    /// # Errors
    ///
    /// - [`PortMapperError::SctpAddressMissingIp`] for an SCTP container address with no IP
    /// - [`PortMapperError::ProtocolMismatch`] if `container_v6` is not of the same protocol
    /// - [`PortMapperError::PortAlreadyMapped`] if the host address is already mapped
    /// - [`PortMapperError::Allocator`] if no port can be reserved
    /// - [`PortMapperError::Rule`] or [`PortMapperError::Relay`] on rule or relay failures
    /// - [`PortMapperError::Rollback`] if the cleanup after any of the above failed too
    pub fn map_range(
        &self,
        container: &TransportAddr,
        container_v6: Option<&TransportAddr>,
        host_ip: Option<IpAddr>,
        start: u16,
        end: u16,
        use_proxy: bool,
    ) -> Result<TransportAddr, PortMapperError> {
        let mut state = self.lock();

        let proto = container.protocol();
        container.validate()?;
        if let Some(v6) = container_v6 {
            v6.validate()?;
            if v6.protocol() != proto {
                return Err(PortMapperError::ProtocolMismatch {
                    v4: proto,
                    v6: v6.protocol(),
                });
            }
        }

        let host_ip = host_ip.unwrap_or(DEFAULT_IP);
        if start != 0 && start == end {
            let key = MappingKey::new(host_ip, start, proto);
            if state.registry.contains(&key) {
                return Err(PortMapperError::PortAlreadyMapped(key));
            }
        }

        let port = self
            .allocator
            .request_port_in_range(Some(host_ip), proto, start, end)?;
        let host = TransportAddr::new(proto, host_ip, port);
        let key = MappingKey::new(host_ip, port, proto);
        debug!("Mapping {key} to {container}");

        let mut rollback = Rollback::new();
        rollback.push(Undo::ReleasePort {
            ip: host_ip,
            proto,
            port,
        });

        let mut relay = match self.new_relay(&host, container, use_proxy) {
            Ok(relay) => relay,
            Err(cause) => {
                let err = rollback.unwind(cause, |step| self.undo(step, None));
                error!("Failed to map {key} to {container}: {err}");
                return Err(err);
            }
        };

        if let Err(cause) = Self::install(
            &state,
            &key,
            &host,
            container,
            container_v6,
            &mut rollback,
            relay.as_mut(),
        ) {
            let err = rollback.unwind(cause, |step| self.undo(step, Some(&mut relay)));
            error!("Failed to map {key} to {container}: {err}");
            return Err(err);
        }

        let mapping = Mapping::new(
            host.clone(),
            container.clone(),
            container_v6.cloned(),
            state.bridge.clone(),
            relay,
        );
        if !state.registry.insert_if_absent(key.clone(), mapping) {
            // The rejected mapping was dropped along with its relay
            let cause = PortMapperError::PortAlreadyMapped(key.clone());
            let err = rollback.unwind(cause, |step| self.undo(step, None));
            error!("Failed to map {key} to {container}: {err}");
            return Err(err);
        }
        rollback.commit();
        info!("Mapped {key} to {container}");
        Ok(host)
    }

    fn new_relay(
        &self,
        host: &TransportAddr,
        container: &TransportAddr,
        use_proxy: bool,
    ) -> Result<Box<dyn Relay>, PortMapperError> {
        let spec = RelaySpec::new(host, container)?;
        let factory = if use_proxy {
            &self.proxy_factory
        } else {
            &self.dummy_factory
        };
        Ok(factory.new_relay(&spec)?)
    }

    /// Install the forwarding rules and start the relay, pushing every step to `rollback`.
    fn install(
        state: &MapperState,
        key: &MappingKey,
        host: &TransportAddr,
        container: &TransportAddr,
        container_v6: Option<&TransportAddr>,
        rollback: &mut Rollback,
        relay: &mut dyn Relay,
    ) -> Result<(), PortMapperError> {
        if state.registry.contains(key) {
            return Err(PortMapperError::PortAlreadyMapped(key.clone()));
        }

        let container_v4 =
            Some(container).filter(|c| c.ip().is_some_and(|ip| ip.to_canonical().is_ipv4()));
        let targets = [(IpVersion::V4, container_v4), (IpVersion::V6, container_v6)];
        for (version, target) in targets {
            let (Some(target), Some(chain)) = (target, state.chain(version)) else {
                continue;
            };
            let bridge = state.bridge.as_ref();
            let Some(rule) = MapperState::forward_rule(host, target, bridge) else {
                continue;
            };
            chain.forward(Action::Append, &rule)?;
            debug!("Installed {version} rule {rule}");
            rollback.push(Undo::DeleteRule {
                version,
                chain: chain.clone(),
                rule,
            });
        }

        rollback.push(Undo::StopRelay);
        relay.start()?;
        Ok(())
    }

    fn undo(
        &self,
        step: &Undo,
        relay: Option<&mut Box<dyn Relay>>,
    ) -> Result<(), PortMapperError> {
        match step {
            Undo::ReleasePort { ip, proto, port } => {
                self.allocator.release_port(Some(*ip), *proto, *port)?;
            }
            Undo::DeleteRule {
                version,
                chain,
                rule,
            } => {
                debug!("Removing {version} rule {rule}");
                chain.forward(Action::Delete, rule)?;
            }
            Undo::StopRelay => {
                if let Some(relay) = relay {
                    relay.stop()?;
                }
            }
        }
        Ok(())
    }

    /// Remove the mapping of `host`, as returned by [`PortMapper::map_range`].
    ///
    /// Relay and rule failures are logged and do not stop the teardown; the mapping is gone from
    /// the registry either way. The result is that of releasing the host port.
    ///
    /// # Errors
    ///
    /// - [`PortMapperError::SctpAddressMissingIp`] for an SCTP address with no IP
    /// - [`PortMapperError::PortNotMapped`] if `host` is not mapped
    /// - [`PortMapperError::Allocator`] if the host port cannot be released
    pub fn unmap(&self, host: &TransportAddr) -> Result<(), PortMapperError> {
        let mut state = self.lock();
        let key = host.key()?;
        let Some(mut mapping) = state.registry.remove(&key) else {
            return Err(PortMapperError::PortNotMapped(key));
        };

        if let Err(e) = mapping.relay_mut().stop() {
            warn!("Failed to stop relay for {key}: {e}");
        }
        for (version, rule) in MapperState::mapping_rules(&mapping) {
            let Some(chain) = state.chain(version) else {
                continue;
            };
            if let Err(e) = chain.forward(Action::Delete, &rule) {
                error!("Error on {version} delete: {e}");
            }
        }

        let (ip, port) = host.ip_and_port()?;
        self.allocator
            .release_port(Some(ip), host.protocol(), port)?;
        info!("Unmapped {key}");
        Ok(())
    }

    /// Append the forwarding rules of every mapping again, e.g. after the firewall was flushed.
    /// Failures are logged and do not stop the remaining mappings.
    pub fn reinstall_all(&self) {
        let state = self.lock();
        debug!("Reinstalling rules for {} mappings", state.registry.len());
        state.registry.for_each(|key, mapping| {
            for (version, rule) in MapperState::mapping_rules(mapping) {
                let Some(chain) = state.chain(version) else {
                    continue;
                };
                if let Err(e) = chain.forward(Action::Append, &rule) {
                    error!("Error on {version} append for {key}: {e}");
                }
            }
        });
    }

    /// Keys of all current mappings, sorted.
    #[must_use]
    pub fn mapped_keys(&self) -> Vec<MappingKey> {
        let mut keys: Vec<_> = self.lock().registry.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Host addresses of all current mappings, in no particular order.
    #[must_use]
    pub fn mapped_hosts(&self) -> Vec<TransportAddr> {
        let mut hosts = Vec::new();
        self.lock()
            .registry
            .for_each(|_, mapping| hosts.push(mapping.host().clone()));
        hosts
    }

    #[must_use]
    pub fn is_mapped(&self, host: &TransportAddr) -> bool {
        host.key()
            .is_ok_and(|key| self.lock().registry.contains(&key))
    }

    /// Protocol and container addresses of the mapping of `host`, if any.
    #[must_use]
    pub fn lookup(
        &self,
        host: &TransportAddr,
    ) -> Option<(Protocol, TransportAddr, Option<TransportAddr>)> {
        let key = host.key().ok()?;
        let state = self.lock();
        let mapping = state.registry.lookup(&key)?;
        Some((
            mapping.protocol(),
            mapping.container().clone(),
            mapping.container_v6().cloned(),
        ))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().registry.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().registry.is_empty()
    }
}
