//! Resumable provisioning orchestrator for multipass-managed VMs.
//!
//! Drives a virtual machine through a fixed sequence of configuration
//! stages (security hardening, cluster bootstrap, VPN mesh, firewall,
//! secret-store init) by invoking external tools, and survives a flaky
//! virtualization daemon along the way:
//!
//! - [`exec`] — bounded-timeout command execution, captured or streamed,
//!   with a credential-piping elevated variant.
//! - [`classify`] — Fatal/NonFatal failure classification; unknown
//!   failures abort, known-benign ones let the run continue.
//! - [`recovery`] — ordered best-effort daemon remediation gated by a
//!   liveness probe.
//! - [`pipeline`] — the declarative step table with operator-selected
//!   resumption.
//!
//! Single-run by design: step state is not persisted across restarts,
//! steps never run concurrently, and two runs must not target the same
//! instance name at once.

pub mod classify;
pub mod context;
pub mod daemon;
pub mod errors;
pub mod exec;
pub mod inventory;
pub mod logging;
pub mod pipeline;
pub mod recovery;
pub mod store;

pub use classify::{Classification, FailureRecord, FaultClassifier};
pub use context::{ProvisioningContext, Secret};
pub use daemon::{LaunchSpec, VmDaemon};
pub use errors::{ProvisionError, ProvisionResult};
pub use exec::{CommandSpec, ExecMode, ExecutionResult, Executor};
pub use pipeline::{Pipeline, StartPoint, StepEnv};
pub use recovery::{RecoveryProcedure, RecoveryTuning, RemediationOutcome};
pub use store::ValuesStore;
