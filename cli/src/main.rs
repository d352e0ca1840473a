// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]

mod args;
mod config;
mod logging;

use crate::args::{CmdArgs, Parser};
use crate::config::{ConfigError, MappingSpec, RunConfig};
use crate::logging::LoggingError;
use mapper::{PortMapper, PortMapperError, TransportAddr};
use std::process::ExitCode;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Mapper(#[from] PortMapperError),
    #[error("failed to set signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

fn map_one(
    mapper: &PortMapper,
    spec: &MappingSpec,
    use_proxy: bool,
) -> Result<TransportAddr, PortMapperError> {
    let host = mapper.map_range(
        &spec.container,
        spec.container_v6.as_ref(),
        spec.host_ip,
        spec.host_start,
        spec.host_end,
        use_proxy,
    )?;
    match &spec.container_v6 {
        Some(v6) => info!("Mapped {host} to {} and {v6}", spec.container),
        None => info!("Mapped {host} to {}", spec.container),
    }
    Ok(host)
}

fn unmap_all(mapper: &PortMapper, hosts: &[TransportAddr]) {
    for host in hosts.iter().rev() {
        if let Err(e) = mapper.unmap(host) {
            warn!("Failed to unmap {host}: {e}");
        }
    }
}

/// Block until a stop request, reinstalling the forwarding rules every `interval` if set.
fn wait_for_stop(stop_rx: &Receiver<()>, mapper: &PortMapper, interval: Option<Duration>) {
    let Some(interval) = interval else {
        let _ = stop_rx.recv();
        return;
    };
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                debug!("Reinstalling forwarding rules of {} mappings", mapper.len());
                mapper.reinstall_all();
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn run(args: &CmdArgs) -> Result<(), CliError> {
    let config = RunConfig::new(args)?;
    logging::init(config.log.as_deref())?;

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        if stop_tx.send(()).is_err() {
            error!("Failed to send stop request");
        }
    })?;

    info!("Starting port mapper...\n{}", config.mapper);
    let mapper = PortMapper::from_config(&config.mapper)?;

    let mut hosts = Vec::with_capacity(config.mappings.len());
    for spec in &config.mappings {
        match map_one(&mapper, spec, config.userland_proxy) {
            Ok(host) => hosts.push(host),
            Err(e) => {
                error!("Failed to map {}: {e}", spec.container);
                unmap_all(&mapper, &hosts);
                return Err(e.into());
            }
        }
    }

    info!("{} mappings set up, waiting for a stop signal", hosts.len());
    wait_for_stop(&stop_rx, &mapper, config.remap_interval);

    info!("Shutting down");
    unmap_all(&mapper, &hosts);
    Ok(())
}

fn main() -> ExitCode {
    let args = CmdArgs::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // logging may not be up yet
            eprintln!("portmap: {e}");
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
