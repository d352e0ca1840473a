// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

pub(crate) use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(name = "portmap")]
#[command(version)]
#[command(about = "Map host ports to container addresses", long_about = None)]
pub(crate) struct CmdArgs {
    #[arg(long, value_name = "YAML configuration file")]
    pub(crate) config: Option<PathBuf>,

    #[arg(
        long = "map",
        value_name = "[HOST_IP:]HOST_PORT[-END]:CONTAINER_IP:CONTAINER_PORT[/PROTO][,v6=IP]",
        help = "Port mapping to set up (may be repeated)"
    )]
    pub(crate) maps: Vec<String>,

    #[arg(long, default_value_t = false, help = "Relay traffic with the userland proxy")]
    pub(crate) userland_proxy: bool,

    #[arg(long, value_name = "path to the userland proxy binary")]
    pub(crate) proxy_path: Option<PathBuf>,

    #[arg(long, value_name = "bridge the containers are attached to")]
    pub(crate) bridge: Option<String>,

    #[arg(long, value_name = "name of the forwarding chain")]
    pub(crate) chain: Option<String>,

    #[arg(long, value_name = "true|false", help = "Program IPv4 forwarding rules")]
    pub(crate) iptables: Option<bool>,

    #[arg(long, value_name = "true|false", help = "Program IPv6 forwarding rules")]
    pub(crate) ip6tables: Option<bool>,

    #[arg(long, default_value_t = false, help = "Allow hairpin traffic through mapped ports")]
    pub(crate) hairpin: bool,

    #[arg(long, value_name = "START-END", help = "Range for dynamically allocated host ports")]
    pub(crate) port_range: Option<String>,

    #[arg(long, value_name = "seconds", help = "Re-append forwarding rules periodically")]
    pub(crate) remap_interval: Option<u64>,

    #[arg(long, value_name = "target=level[,target=level...]", help = "Log directives")]
    pub(crate) log: Option<String>,
}
