// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! [`RuleInstaller`] backed by the `iptables` and `ip6tables` commands.

use super::{Action, BridgeName, ForwardRule, IpVersion, RuleError, RuleInstaller};
use portalloc::Protocol;
use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Nat,
    Filter,
    Mangle,
}

impl Table {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
            Table::Mangle => "mangle",
        }
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub status: Option<i32>,
    pub stderr: String,
}

/// Runs the rule programs. Abstracted so that rules can be checked without touching the host.
pub trait CommandRunner: Debug + Send + Sync {
    /// Run `program` with `args` to completion.
    ///
    /// # Errors
    ///
    /// Fails only if the program cannot be run at all; a non-zero exit is reported in the output.
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, RuleError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, RuleError> {
        trace!("Running {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| RuleError::Spawn {
                program: program.to_string(),
                source,
            })?;
        Ok(CommandOutput {
            success: output.status.success(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// One rule: where it goes and what it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChainRule {
    pub(crate) table: Table,
    pub(crate) chain: String,
    pub(crate) args: Vec<String>,
}

impl ChainRule {
    fn new(table: Table, chain: &str, args: &[&str]) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
        }
    }
}

/// A user-defined chain holding the DNAT and filter rules of all mappings for one IP family.
#[derive(Debug, Clone)]
pub struct IptablesChain {
    name: String,
    version: IpVersion,
    hairpin: bool,
    runner: Arc<dyn CommandRunner>,
}

impl IptablesChain {
    #[must_use]
    pub fn new(name: &str, version: IpVersion, hairpin: bool) -> Self {
        Self::with_runner(name, version, hairpin, Arc::new(SystemCommandRunner))
    }

    #[must_use]
    pub fn with_runner(
        name: &str,
        version: IpVersion,
        hairpin: bool,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            name: name.to_string(),
            version,
            hairpin,
            runner,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> IpVersion {
        self.version
    }

    /// The rules forwarding traffic as described by `rule`, in programming order.
    pub(crate) fn forward_rules(&self, rule: &ForwardRule) -> Vec<ChainRule> {
        let proto = rule.proto.as_str();
        let daddr = if rule.source_ip.is_unspecified() {
            self.version.any().to_string()
        } else {
            rule.source_ip.to_string()
        };
        let sport = rule.source_port.to_string();
        let dest_ip = rule.dest_ip.to_string();
        let dport = rule.dest_port.to_string();
        let dest = SocketAddr::new(rule.dest_ip, rule.dest_port).to_string();

        let mut dnat = vec![
            "-p",
            proto,
            "-d",
            daddr.as_str(),
            "--dport",
            sport.as_str(),
            "-j",
            "DNAT",
            "--to-destination",
            dest.as_str(),
        ];
        let mut accept = vec![];
        if let Some(bridge) = &rule.bridge {
            if !self.hairpin {
                dnat.extend(["!", "-i", bridge.as_str()]);
            }
            accept.extend(["!", "-i", bridge.as_str(), "-o", bridge.as_str()]);
        }
        accept.extend([
            "-p",
            proto,
            "-d",
            dest_ip.as_str(),
            "--dport",
            dport.as_str(),
            "-j",
            "ACCEPT",
        ]);
        let masquerade = [
            "-p",
            proto,
            "-s",
            dest_ip.as_str(),
            "-d",
            dest_ip.as_str(),
            "--dport",
            dport.as_str(),
            "-j",
            "MASQUERADE",
        ];

        let mut rules = vec![
            ChainRule::new(Table::Nat, &self.name, &dnat),
            ChainRule::new(Table::Filter, &self.name, &accept),
            ChainRule::new(Table::Nat, "POSTROUTING", &masquerade),
        ];
        if rule.proto == Protocol::Sctp {
            rules.push(ChainRule::new(
                Table::Mangle,
                "POSTROUTING",
                &[
                    "-p",
                    "sctp",
                    "--sport",
                    dport.as_str(),
                    "-j",
                    "CHECKSUM",
                    "--checksum-fill",
                ],
            ));
        }
        rules
    }

    fn run(&self, args: Vec<String>) -> Result<(), RuleError> {
        let program = self.version.program();
        let output = self.runner.run(program, &args)?;
        if output.success {
            Ok(())
        } else {
            Err(RuleError::Failed {
                program: program.to_string(),
                args,
                status: output.status,
                stderr: output.stderr,
            })
        }
    }

    fn table_args(table: Table, op: &str, chain: &str, rest: &[String]) -> Vec<String> {
        let mut args = vec![
            "--wait".to_string(),
            "-t".to_string(),
            table.to_string(),
            op.to_string(),
            chain.to_string(),
        ];
        args.extend(rest.iter().cloned());
        args
    }

    fn exists(&self, rule: &ChainRule) -> Result<bool, RuleError> {
        let args = Self::table_args(rule.table, "-C", &rule.chain, &rule.args);
        let output = self.runner.run(self.version.program(), &args)?;
        Ok(output.success)
    }

    fn program_rule(&self, action: Action, rule: &ChainRule) -> Result<(), RuleError> {
        let exists = self.exists(rule)?;
        match (action, exists) {
            (Action::Append | Action::Insert, true) | (Action::Delete, false) => {
                trace!(
                    "Skipping {action} of {} rule in {}/{}: nothing to do",
                    self.version, rule.table, rule.chain
                );
                return Ok(());
            }
            _ => {}
        }
        self.run(Self::table_args(
            rule.table,
            action.as_flag(),
            &rule.chain,
            &rule.args,
        ))
    }

    /// Rules sending traffic into this chain from the built-in chains.
    pub(crate) fn jump_rules(&self, bridge: Option<&BridgeName>) -> Vec<ChainRule> {
        let mut rules = vec![ChainRule::new(
            Table::Nat,
            "PREROUTING",
            &["-m", "addrtype", "--dst-type", "LOCAL", "-j", self.name.as_str()],
        )];
        let mut output = vec!["-m", "addrtype", "--dst-type", "LOCAL", "-j", self.name.as_str()];
        if !self.hairpin {
            match self.version {
                IpVersion::V4 => output.extend(["!", "-d", "127.0.0.0/8"]),
                IpVersion::V6 => output.extend(["!", "-d", "::1/128"]),
            }
        }
        rules.push(ChainRule::new(Table::Nat, "OUTPUT", &output));
        if let Some(bridge) = bridge {
            rules.push(ChainRule::new(
                Table::Filter,
                "FORWARD",
                &["-o", bridge.as_str(), "-j", self.name.as_str()],
            ));
        }
        rules
    }

    /// Create the chain in the `nat` and `filter` tables if missing, and hook it into the
    /// built-in chains.
    ///
    /// # Errors
    ///
    /// Fails if any of the commands fails.
    pub fn ensure_chain(&self, bridge: Option<&BridgeName>) -> Result<(), RuleError> {
        for table in [Table::Nat, Table::Filter] {
            let list = Self::table_args(table, "-n", "-L", &[self.name.clone()]);
            let listed = self.runner.run(self.version.program(), &list)?;
            if !listed.success {
                debug!("Creating {} chain {} in table {table}", self.version, self.name);
                self.run(Self::table_args(table, "-N", &self.name, &[]))?;
            }
        }
        for rule in self.jump_rules(bridge) {
            self.program_rule(Action::Insert, &rule)?;
        }
        Ok(())
    }
}

impl RuleInstaller for IptablesChain {
    fn forward(&self, action: Action, rule: &ForwardRule) -> Result<(), RuleError> {
        debug!("{} {action} forwarding {rule}", self.version);
        let rules = self.forward_rules(rule);
        if action == Action::Delete {
            for chain_rule in &rules {
                self.program_rule(action, chain_rule)?;
            }
            return Ok(());
        }

        // A partially installed forwarding is removed before reporting the failure
        for (done, chain_rule) in rules.iter().enumerate() {
            if let Err(e) = self.program_rule(action, chain_rule) {
                for installed in rules[..done].iter().rev() {
                    if let Err(undo) = self.program_rule(Action::Delete, installed) {
                        warn!(
                            "Failed to remove {} rule in {}/{}: {undo}",
                            self.version, installed.table, installed.chain
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::sync::Mutex;

    /// Records every command and pretends a set of rules exists on the host.
    #[derive(Debug, Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<Vec<String>>>,
        existing: Mutex<HashSet<Vec<String>>>,
        fail_on: Option<&'static str>,
        fail_table: Option<&'static str>,
    }

    impl RecordingRunner {
        fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|call| call.join(" "))
                .collect()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, RuleError> {
            let mut call = vec![program.to_string()];
            call.extend(args.iter().cloned());
            self.calls.lock().unwrap().push(call);

            // Key rules by table, chain and match, whatever the operation
            let mut key = args.to_vec();
            if key.len() > 3 {
                key.remove(3);
            }
            let op = args.get(3).map_or("", String::as_str);
            let table = args.get(2).map(String::as_str);
            let refused = Some(op) == self.fail_on
                || (self.fail_table.is_some() && table == self.fail_table);
            let mut existing = self.existing.lock().unwrap();
            let success = match op {
                "-C" => existing.contains(&key),
                "-A" | "-I" => !refused && existing.insert(key),
                "-D" => Some(op) != self.fail_on && existing.remove(&key),
                "-n" | "-N" => true,
                _ => false,
            };
            Ok(CommandOutput {
                success,
                status: Some(i32::from(!success)),
                stderr: if success { String::new() } else { "boom".to_string() },
            })
        }
    }

    fn rule(bridge: Option<&str>) -> ForwardRule {
        ForwardRule {
            proto: Protocol::Tcp,
            source_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            source_port: 8080,
            dest_ip: IpAddr::V4(Ipv4Addr::new(172, 17, 0, 2)),
            dest_port: 80,
            bridge: bridge.map(|b| BridgeName::try_from(b).unwrap()),
        }
    }

    fn rendered(rules: &[ChainRule]) -> Vec<String> {
        rules
            .iter()
            .map(|r| format!("{} {} {}", r.table, r.chain, r.args.join(" ")))
            .collect()
    }

    #[test]
    fn test_forward_rules_with_bridge() {
        let chain = IptablesChain::new("PORTMAP", IpVersion::V4, false);
        assert_eq!(
            rendered(&chain.forward_rules(&rule(Some("docker0")))),
            [
                "nat PORTMAP -p tcp -d 0/0 --dport 8080 -j DNAT --to-destination 172.17.0.2:80 ! -i docker0",
                "filter PORTMAP ! -i docker0 -o docker0 -p tcp -d 172.17.0.2 --dport 80 -j ACCEPT",
                "nat POSTROUTING -p tcp -s 172.17.0.2 -d 172.17.0.2 --dport 80 -j MASQUERADE",
            ]
        );
    }

    #[test]
    fn test_forward_rules_hairpin_no_bridge() {
        let chain = IptablesChain::new("PORTMAP", IpVersion::V4, true);
        let mut fwd = rule(Some("docker0"));
        fwd.source_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let rules = rendered(&chain.forward_rules(&fwd));
        assert_eq!(
            rules[0],
            "nat PORTMAP -p tcp -d 10.0.0.1 --dport 8080 -j DNAT --to-destination 172.17.0.2:80"
        );

        let rules = rendered(&chain.forward_rules(&rule(None)));
        assert_eq!(
            rules[1],
            "filter PORTMAP -p tcp -d 172.17.0.2 --dport 80 -j ACCEPT"
        );
    }

    #[test]
    fn test_forward_rules_ipv6_sctp() {
        let chain = IptablesChain::new("PORTMAP", IpVersion::V6, false);
        let fwd = ForwardRule {
            proto: Protocol::Sctp,
            source_ip: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            source_port: 9,
            dest_ip: IpAddr::V6("fd00::2".parse().unwrap()),
            dest_port: 99,
            bridge: None,
        };
        assert_eq!(
            rendered(&chain.forward_rules(&fwd)),
            [
                "nat PORTMAP -p sctp -d ::/0 --dport 9 -j DNAT --to-destination [fd00::2]:99",
                "filter PORTMAP -p sctp -d fd00::2 --dport 99 -j ACCEPT",
                "nat POSTROUTING -p sctp -s fd00::2 -d fd00::2 --dport 99 -j MASQUERADE",
                "mangle POSTROUTING -p sctp --sport 99 -j CHECKSUM --checksum-fill",
            ]
        );
    }

    #[test]
    fn test_forward_is_idempotent() {
        let runner = Arc::new(RecordingRunner::default());
        let chain = IptablesChain::with_runner("PORTMAP", IpVersion::V4, false, runner.clone());
        let fwd = rule(Some("docker0"));

        chain.forward(Action::Append, &fwd).unwrap();
        let appends = |runner: &RecordingRunner| {
            runner
                .calls()
                .iter()
                .filter(|c| c.contains(" -A "))
                .count()
        };
        assert_eq!(appends(&runner), 3);
        assert!(runner.calls()[0].starts_with("iptables --wait -t nat -C PORTMAP -p tcp"));

        // Appending again only checks
        chain.forward(Action::Append, &fwd).unwrap();
        assert_eq!(appends(&runner), 3);

        chain.forward(Action::Delete, &fwd).unwrap();
        chain.forward(Action::Delete, &fwd).unwrap();
        let deletes = runner.calls().iter().filter(|c| c.contains(" -D ")).count();
        assert_eq!(deletes, 3);
        assert!(runner.existing.lock().unwrap().is_empty());
    }

    #[test]
    fn test_forward_failure() {
        let runner = Arc::new(RecordingRunner {
            fail_on: Some("-A"),
            ..Default::default()
        });
        let chain = IptablesChain::with_runner("PORTMAP", IpVersion::V6, false, runner.clone());
        let err = chain.forward(Action::Append, &rule(None)).unwrap_err();
        match err {
            RuleError::Failed {
                program, stderr, ..
            } => {
                assert_eq!(program, "ip6tables");
                assert_eq!(stderr, "boom");
            }
            RuleError::Spawn { .. } => panic!("unexpected spawn error"),
        }
        // Stops at the first failing rule
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn test_forward_failure_removes_installed_rules() {
        let runner = Arc::new(RecordingRunner {
            fail_table: Some("filter"),
            ..Default::default()
        });
        let chain = IptablesChain::with_runner("PORTMAP", IpVersion::V4, false, runner.clone());
        let mut fwd = rule(Some("docker0"));
        fwd.proto = Protocol::Sctp;

        let err = chain.forward(Action::Append, &fwd).unwrap_err();
        assert!(matches!(err, RuleError::Failed { .. }));
        // The DNAT rule went in before the filter rule failed, and was taken out again
        let calls = runner.calls();
        assert!(calls.iter().any(|c| c.starts_with("iptables --wait -t nat -A PORTMAP")));
        assert!(calls.iter().any(|c| c.starts_with("iptables --wait -t nat -D PORTMAP")));
        assert!(!calls.iter().any(|c| c.contains("POSTROUTING")));
        assert!(runner.existing.lock().unwrap().is_empty());
    }

    #[test]
    fn test_ensure_chain() {
        let runner = Arc::new(RecordingRunner::default());
        let chain = IptablesChain::with_runner("PORTMAP", IpVersion::V4, false, runner.clone());
        let bridge = BridgeName::try_from("docker0").unwrap();
        chain.ensure_chain(Some(&bridge)).unwrap();
        let calls = runner.calls();
        assert_eq!(calls[0], "iptables --wait -t nat -n -L PORTMAP");
        assert_eq!(calls[1], "iptables --wait -t filter -n -L PORTMAP");
        assert!(calls.contains(
            &"iptables --wait -t nat -I OUTPUT -m addrtype --dst-type LOCAL -j PORTMAP ! -d 127.0.0.0/8"
                .to_string()
        ));
        assert!(calls.contains(&"iptables --wait -t filter -I FORWARD -o docker0 -j PORTMAP".to_string()));
    }
}
