//! Daemon recovery procedure.
//!
//! Restores the virtualization daemon and its managed instance to a
//! retryable state after the daemon stops responding or leaves an
//! instance half-provisioned. The procedure is an ordered list of
//! independent remediation actions; each action's outcome is recorded
//! and the driver proceeds unconditionally, so completion never depends
//! on any individual action succeeding. The postcondition is "the daemon
//! answers a liveness probe", never "no residue" — the target instance
//! definition is destroyed along the way, so callers may need to resume
//! the pipeline from instance creation afterward.

use std::time::Duration;

use sysinfo::System;

use crate::context::{ProvisioningContext, Secret};
use crate::daemon::VmDaemon;
use crate::errors::{ProvisionError, ProvisionResult};
use crate::exec::Executor;

/// Hypervisor worker process spawned by the daemon per instance.
const HYPERVISOR_WORKER: &str = "qemu-system-x86_64";
/// Daemon service target for the host service manager.
const SERVICE_TARGET: &str = "system/com.canonical.multipassd";
/// Service definition used by the unload/reload fallback.
const SERVICE_PLIST: &str = "/Library/LaunchDaemons/com.canonical.multipassd.plist";
/// On-disk instance data left behind by the daemon.
const INSTANCE_DATA_DIR: &str =
    "/var/root/Library/Application Support/multipassd/qemu/vault/instances";

/// Settling delays between remediation actions. The daemon needs time to
/// re-establish its control socket after a restart; tests zero these out.
#[derive(Debug, Clone)]
pub struct RecoveryTuning {
    /// After killing worker processes.
    pub kill_settle: Duration,
    /// Between service unload and reload in the fallback path.
    pub reload_settle: Duration,
    /// After the daemon service comes back, before issuing commands.
    pub restart_settle: Duration,
}

impl Default for RecoveryTuning {
    fn default() -> Self {
        Self {
            kill_settle: Duration::from_secs(3),
            reload_settle: Duration::from_secs(5),
            restart_settle: Duration::from_secs(10),
        }
    }
}

impl RecoveryTuning {
    /// No settling delays.
    pub fn instant() -> Self {
        Self {
            kill_settle: Duration::ZERO,
            reload_settle: Duration::ZERO,
            restart_settle: Duration::ZERO,
        }
    }
}

/// Result of one remediation action.
#[derive(Debug)]
pub struct RemediationOutcome {
    pub action: &'static str,
    pub result: Result<(), String>,
}

/// Ordered, best-effort daemon remediation gated by a liveness probe.
pub struct RecoveryProcedure {
    exec: Executor,
    daemon: VmDaemon,
    tuning: RecoveryTuning,
}

impl RecoveryProcedure {
    /// Fixed action order; `run` emits exactly one outcome per entry.
    pub const ACTIONS: [&'static str; 7] = [
        "stop_all_instances",
        "force_kill_workers",
        "restart_daemon_service",
        "start_all_instances",
        "force_kill_workers_again",
        "delete_purge_instance",
        "remove_stale_instance_data",
    ];

    pub fn new(exec: Executor, tuning: RecoveryTuning) -> Self {
        let daemon = VmDaemon::new(exec.clone());
        Self {
            exec,
            daemon,
            tuning,
        }
    }

    /// Idempotent fast path: a passing probe means no recovery work.
    pub async fn is_responsive(&self) -> bool {
        self.daemon.probe().await.is_ok()
    }

    /// Probe; on failure run the full remediation sequence, then probe
    /// again. Only the final probe outcome decides the result.
    pub async fn ensure_responsive(&self, ctx: &ProvisioningContext) -> ProvisionResult<()> {
        match self.daemon.probe().await {
            Ok(()) => {
                tracing::debug!("daemon liveness probe passed, skipping recovery");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(error = %err, "daemon liveness probe failed, starting recovery");
            }
        }

        let outcomes = self.run(ctx).await;
        log_outcomes(&outcomes);

        self.daemon.probe().await.map_err(|err| {
            ProvisionError::DaemonUnresponsive(format!("daemon still down after recovery: {err}"))
        })
    }

    /// Execute every remediation action in order, recording outcomes.
    /// Never raises past its own boundary.
    pub async fn run(&self, ctx: &ProvisioningContext) -> Vec<RemediationOutcome> {
        tracing::info!(instance = ctx.instance(), "starting daemon recovery");
        let credential = ctx.credential();
        let mut outcomes = Vec::with_capacity(Self::ACTIONS.len());

        outcomes.push(outcome(Self::ACTIONS[0], self.daemon.stop_all().await));

        let killed = force_kill_workers(&self.exec, ctx.instance(), credential).await;
        outcomes.push(outcome(Self::ACTIONS[1], killed.map(drop)));
        tokio::time::sleep(self.tuning.kill_settle).await;

        outcomes.push(outcome(
            Self::ACTIONS[2],
            self.restart_daemon_service(credential).await,
        ));

        outcomes.push(outcome(Self::ACTIONS[3], self.daemon.start_all().await));

        // A restart can respawn a stuck worker; sweep once more.
        let killed = force_kill_workers(&self.exec, ctx.instance(), credential).await;
        outcomes.push(outcome(Self::ACTIONS[4], killed.map(drop)));

        outcomes.push(outcome(
            Self::ACTIONS[5],
            self.daemon.delete_purge(ctx.instance()).await,
        ));

        let stale_dir = format!("{INSTANCE_DATA_DIR}/{}", ctx.instance());
        outcomes.push(outcome(
            Self::ACTIONS[6],
            self.exec
                .elevated(&format!("rm -rf '{stale_dir}'"), credential)
                .await
                .map(drop),
        ));

        tracing::info!(instance = ctx.instance(), "daemon recovery complete");
        outcomes
    }

    /// Primary restart via the service manager; explicit unload/reload
    /// fallback if that fails. Either way the daemon gets a settling
    /// period before the next action talks to it.
    async fn restart_daemon_service(&self, credential: &Secret) -> ProvisionResult<()> {
        let primary = self
            .exec
            .elevated(&format!("launchctl kickstart -k {SERVICE_TARGET}"), credential)
            .await;

        if let Err(err) = primary {
            tracing::warn!(error = %err, "primary daemon restart failed, trying unload/reload");
            self.exec
                .elevated(&format!("launchctl unload {SERVICE_PLIST}"), credential)
                .await
                .map(drop)?;
            tokio::time::sleep(self.tuning.reload_settle).await;
            self.exec
                .elevated(&format!("launchctl load {SERVICE_PLIST}"), credential)
                .await
                .map(drop)?;
        }

        tokio::time::sleep(self.tuning.restart_settle).await;
        Ok(())
    }
}

fn outcome(action: &'static str, result: ProvisionResult<()>) -> RemediationOutcome {
    let result = result.map_err(|err| {
        tracing::warn!(action, error = %err, "remediation action failed, continuing");
        err.to_string()
    });
    RemediationOutcome { action, result }
}

fn log_outcomes(outcomes: &[RemediationOutcome]) {
    for o in outcomes {
        match &o.result {
            Ok(()) => tracing::info!(action = o.action, "remediation action ok"),
            Err(err) => tracing::warn!(action = o.action, error = %err, "remediation action failed"),
        }
    }
}

/// Forcefully terminate lingering hypervisor workers for the instance.
///
/// Scans the process table for workers whose command line names the
/// instance. Tries a direct SIGKILL first and escalates through the
/// privilege-elevation collaborator when the caller lacks permission to
/// signal the daemon-owned process. Returns the number of workers killed.
pub async fn force_kill_workers(
    exec: &Executor,
    instance: &str,
    credential: &Secret,
) -> ProvisionResult<usize> {
    let mut sys = System::new_all();
    sys.refresh_processes();

    let mut killed = 0;
    for (pid, process) in sys.processes() {
        let cmdline = process.cmd().join(" ");
        if !cmdline.contains(HYPERVISOR_WORKER) || !cmdline.contains(instance) {
            continue;
        }
        let pid = pid.as_u32();
        tracing::info!(pid, instance, "killing hypervisor worker");
        if process.kill() {
            killed += 1;
        } else {
            // Daemon-owned worker; we cannot signal it directly.
            exec.elevated(&format!("kill -9 {pid}"), credential).await?;
            killed += 1;
        }
    }

    if killed == 0 {
        tracing::debug!(instance, "no lingering hypervisor workers found");
    }
    Ok(killed)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use super::*;
    use crate::exec::fake::{FakeRunner, failed_result, ok_result, timed_out_result};

    fn test_ctx() -> ProvisioningContext {
        ProvisioningContext::with_paths(
            "node-a".into(),
            Secret::new("pw"),
            Path::new("/tmp/keys"),
            PathBuf::from("inventory.ini"),
            PathBuf::from("values.json"),
        )
    }

    fn procedure(runner: Arc<FakeRunner>) -> RecoveryProcedure {
        RecoveryProcedure::new(Executor::with_runner(runner), RecoveryTuning::instant())
    }

    #[tokio::test]
    async fn passing_probe_short_circuits_recovery() {
        let runner = Arc::new(FakeRunner::succeeding());
        let recovery = procedure(Arc::clone(&runner));

        recovery.ensure_responsive(&test_ctx()).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1, "probe only, no side effects: {calls:?}");
        assert!(calls[0].contains("multipass list"));
    }

    #[tokio::test]
    async fn all_actions_run_even_when_every_command_fails() {
        let runner = Arc::new(FakeRunner::new(|_| Ok(failed_result(1, "degraded"))));
        let recovery = procedure(Arc::clone(&runner));

        let outcomes = recovery.run(&test_ctx()).await;

        let actions: Vec<&str> = outcomes.iter().map(|o| o.action).collect();
        assert_eq!(actions, RecoveryProcedure::ACTIONS);
        // Commands all failed, so every command-backed action reports Err.
        assert!(outcomes[0].result.is_err());
        assert!(outcomes[2].result.is_err());
        assert!(outcomes[5].result.is_err());
        assert!(outcomes[6].result.is_err());
    }

    #[tokio::test]
    async fn restart_falls_back_to_unload_reload() {
        let runner = Arc::new(FakeRunner::new(|spec| {
            let text = spec.display();
            if text.contains("kickstart") {
                Ok(failed_result(1, "service not loaded"))
            } else {
                Ok(ok_result(""))
            }
        }));
        let recovery = procedure(Arc::clone(&runner));

        let outcomes = recovery.run(&test_ctx()).await;
        assert!(outcomes[2].result.is_ok());
        assert_eq!(runner.call_count("launchctl unload"), 1);
        assert_eq!(runner.call_count("launchctl load"), 1);
    }

    #[tokio::test]
    async fn hung_probe_runs_recovery_then_probes_again() {
        let runner = Arc::new(FakeRunner::new(|spec| {
            if spec.display().contains("multipass list") {
                Ok(timed_out_result())
            } else {
                Ok(ok_result(""))
            }
        }));
        let recovery = procedure(Arc::clone(&runner));

        let err = recovery.ensure_responsive(&test_ctx()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::DaemonUnresponsive(_)));

        // One probe before recovery, one after.
        assert_eq!(runner.call_count("multipass list"), 2);
        // Remediation ran in between.
        assert_eq!(runner.call_count("multipass stop --all"), 1);
        assert_eq!(runner.call_count("delete node-a --purge"), 1);
    }
}
