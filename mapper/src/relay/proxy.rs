// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Userland proxy relay: an external process forwarding traffic for one mapping.
//!
//! The proxy is told about the mapping on its command line and reports its start status on a
//! pipe passed as file descriptor 3: `"0\n"` on success, `"1\n"` followed by an error message
//! otherwise.

use super::{Relay, RelayError, RelayFactory, RelaySpec};
use command_fds::{CommandFdExt, FdMapping};
use crossbeam_channel::RecvTimeoutError;
use nix::sys::signal::{Signal, kill};
use nix::fcntl::OFlag;
use nix::unistd::{Pid, pipe2};
use std::fs::File;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

/// Name of the userland proxy binary, looked up in `PATH` when no explicit path is configured.
pub const PROXY_COMMAND_NAME: &str = "docker-proxy";

/// How long the proxy gets to report its start status.
pub const PROXY_START_TIMEOUT: Duration = Duration::from_secs(16);

const STATUS_FD: i32 = 3;

/// Builds [`ProxyCommand`] relays.
#[derive(Debug, Clone)]
pub struct ProxyCommandFactory {
    proxy_path: Option<PathBuf>,
    start_timeout: Duration,
}

impl ProxyCommandFactory {
    /// Create a factory for proxies at `proxy_path`, or at [`PROXY_COMMAND_NAME`] in `PATH` if
    /// `None`. The path is resolved when each relay is built.
    #[must_use]
    pub fn new(proxy_path: Option<PathBuf>) -> Self {
        Self {
            proxy_path,
            start_timeout: PROXY_START_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_start_timeout(mut self, start_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self
    }

    fn resolve(&self) -> Result<PathBuf, RelayError> {
        match &self.proxy_path {
            Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            _ => find_in_path(PROXY_COMMAND_NAME)
                .ok_or_else(|| RelayError::ProxyNotFound(PROXY_COMMAND_NAME.to_string())),
        }
    }
}

impl RelayFactory for ProxyCommandFactory {
    fn new_relay(&self, spec: &RelaySpec) -> Result<Box<dyn Relay>, RelayError> {
        let path = self.resolve()?;
        Ok(Box::new(ProxyCommand::new(path, spec, self.start_timeout)))
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// A userland proxy process. Built stopped; [`Relay::start`] spawns the process and waits for
/// its status report.
#[derive(Debug)]
pub struct ProxyCommand {
    path: PathBuf,
    args: Vec<String>,
    start_timeout: Duration,
    child: Option<Child>,
}

impl ProxyCommand {
    #[must_use]
    pub fn new(path: PathBuf, spec: &RelaySpec, start_timeout: Duration) -> Self {
        let args = vec![
            "-proto".to_string(),
            spec.proto.to_string(),
            "-host-ip".to_string(),
            spec.host_ip.to_string(),
            "-host-port".to_string(),
            spec.host_port.to_string(),
            "-container-ip".to_string(),
            spec.container_ip.to_string(),
            "-container-port".to_string(),
            spec.container_port.to_string(),
        ];
        Self {
            path,
            args,
            start_timeout,
            child: None,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Whether the proxy process has been spawned and not yet stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    fn spawn(&self) -> Result<(Child, File), RelayError> {
        let (reader, writer) = status_pipe()?;
        let mut command = Command::new(&self.path);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
            .fd_mappings(vec![FdMapping {
                parent_fd: writer,
                child_fd: STATUS_FD,
            }])
            .map_err(|_| RelayError::FdMapping)?;
        let child = command.spawn().map_err(RelayError::Spawn)?;
        // Dropping the command closes our copy of the write end, so that the reader sees EOF
        // once the proxy is gone.
        drop(command);
        Ok((child, File::from(reader)))
    }

    fn wait_for_status(&self, mut status: File) -> Result<(), RelayError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::Builder::new()
            .name("proxy-status".to_string())
            .spawn(move || {
                let _ = tx.send(read_status(&mut status));
            })
            .map_err(RelayError::Thread)?;

        match rx.recv_timeout(self.start_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(RelayError::StartTimeout(self.start_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(RelayError::ProxyFailed(
                "status reader exited without a result".to_string(),
            )),
        }
    }

    fn terminate(child: &mut Child, signal: Signal) -> Result<(), RelayError> {
        let pid = i32::try_from(child.id())
            .map(Pid::from_raw)
            .map_err(|_| RelayError::Signal(nix::Error::ESRCH))?;
        match kill(pid, signal) {
            // Already gone, just reap it
            Ok(()) | Err(nix::Error::ESRCH) => {}
            Err(e) => return Err(RelayError::Signal(e)),
        }
        child.wait().map_err(RelayError::Wait)?;
        Ok(())
    }
}

/// Both ends are close-on-exec: only the copy mapped to the status descriptor reaches the proxy.
fn status_pipe() -> Result<(OwnedFd, OwnedFd), RelayError> {
    pipe2(OFlag::O_CLOEXEC).map_err(RelayError::Pipe)
}

fn read_status(status: &mut File) -> Result<(), RelayError> {
    let mut code = [0u8; 2];
    if let Err(e) = status.read_exact(&mut code) {
        return Err(RelayError::ProxyFailed(format!(
            "proxy exited without reporting status: {e}"
        )));
    }
    if &code == b"0\n" {
        return Ok(());
    }
    let mut message = String::new();
    let _ = status.read_to_string(&mut message);
    let message = message.trim();
    if message.is_empty() {
        Err(RelayError::ProxyFailed(format!(
            "unexpected status {:?}",
            String::from_utf8_lossy(&code)
        )))
    } else {
        Err(RelayError::ProxyFailed(message.to_string()))
    }
}

impl Relay for ProxyCommand {
    fn start(&mut self) -> Result<(), RelayError> {
        if self.child.is_some() {
            return Ok(());
        }
        debug!(
            "Starting userland proxy {} {}",
            self.path.display(),
            self.args.join(" ")
        );
        let (mut child, status) = self.spawn()?;
        if let Err(e) = self.wait_for_status(status) {
            if let Err(kill_err) = Self::terminate(&mut child, Signal::SIGKILL) {
                warn!("Failed to clean up userland proxy after failed start: {kill_err}");
            }
            return Err(e);
        }
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RelayError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        debug!("Stopping userland proxy (pid {})", child.id());
        Self::terminate(&mut child, Signal::SIGINT)
    }
}

impl Drop for ProxyCommand {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop userland proxy: {e}");
        }
    }
}
