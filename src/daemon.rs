//! Virtualization daemon CLI collaborator (multipass).
//!
//! Exit status and textual output are the only contract with the daemon;
//! the one structured assumption is the `IPv4:` line format of `info`.

use std::path::Path;
use std::time::Duration;

use crate::errors::{ProvisionError, ProvisionResult};
use crate::exec::{CommandSpec, Executor};

/// Bound for the cheap liveness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound for stop/delete operations during recovery.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound for restarting all instances after a daemon restart.
pub const START_TIMEOUT: Duration = Duration::from_secs(60);

/// Instance size parameters for `launch`.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub memory: String,
    pub disk: String,
    pub cpus: u32,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            memory: "4G".into(),
            disk: "20G".into(),
            cpus: 2,
        }
    }
}

/// Thin wrapper over the daemon's CLI.
#[derive(Clone)]
pub struct VmDaemon {
    exec: Executor,
}

impl VmDaemon {
    pub fn new(exec: Executor) -> Self {
        Self { exec }
    }

    /// Liveness probe: a cheap inventory listing with a short bound.
    /// Any failure maps to `DaemonUnresponsive`.
    pub async fn probe(&self) -> ProvisionResult<()> {
        let spec = CommandSpec::new("multipass", ["list"]).timeout(PROBE_TIMEOUT);
        self.exec
            .run(spec)
            .await
            .map(|_| ())
            .map_err(|err| ProvisionError::DaemonUnresponsive(err.to_string()))
    }

    /// Launch a fresh instance with named size parameters.
    pub async fn launch(&self, name: &str, size: &LaunchSpec) -> ProvisionResult<()> {
        let spec = CommandSpec::new(
            "multipass",
            [
                "launch".to_string(),
                "--name".to_string(),
                name.to_string(),
                "--memory".to_string(),
                size.memory.clone(),
                "--disk".to_string(),
                size.disk.clone(),
                "--cpus".to_string(),
                size.cpus.to_string(),
            ],
        );
        self.exec.run(spec).await.map(|_| ())
    }

    /// Discover the instance's network address from the `IPv4:` line of
    /// `info` output.
    pub async fn address(&self, name: &str) -> ProvisionResult<String> {
        let out = self
            .exec
            .capture(CommandSpec::new("multipass", ["info", name]))
            .await?;
        parse_address(&out).ok_or_else(|| {
            ProvisionError::Internal(format!("no IPv4 line in daemon info output for {name}"))
        })
    }

    /// Transfer a local file into the instance's home directory.
    pub async fn transfer(&self, local: &Path, name: &str) -> ProvisionResult<()> {
        let spec = CommandSpec::new(
            "multipass",
            [
                "transfer".to_string(),
                local.display().to_string(),
                format!("{name}:"),
            ],
        );
        self.exec.run(spec).await.map(|_| ())
    }

    /// Execute a shell script inside the instance.
    pub async fn exec_in(&self, name: &str, script: &str) -> ProvisionResult<String> {
        let spec = CommandSpec::new("multipass", ["exec", name, "--", "bash", "-c", script]);
        self.exec.capture(spec).await
    }

    pub async fn stop_all(&self) -> ProvisionResult<()> {
        let spec = CommandSpec::new("multipass", ["stop", "--all"]).timeout(STOP_TIMEOUT);
        self.exec.run(spec).await.map(|_| ())
    }

    pub async fn start_all(&self) -> ProvisionResult<()> {
        let spec = CommandSpec::new("multipass", ["start", "--all"]).timeout(START_TIMEOUT);
        self.exec.run(spec).await.map(|_| ())
    }

    /// Delete and purge an instance definition. Absence is not an error
    /// at call sites; callers ignore the result where appropriate.
    pub async fn delete_purge(&self, name: &str) -> ProvisionResult<()> {
        let spec =
            CommandSpec::new("multipass", ["delete", name, "--purge"]).timeout(STOP_TIMEOUT);
        self.exec.run(spec).await.map(|_| ())
    }
}

fn parse_address(info_output: &str) -> Option<String> {
    info_output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("IPv4:"))
        .and_then(|line| line.split(':').nth(1))
        .map(|addr| addr.trim().to_string())
        .filter(|addr| !addr.is_empty())
}
