//! Resumable step pipeline.
//!
//! Steps live in one declarative table (stable id, menu label, action),
//! so the resumption menu and the execution order cannot drift apart.
//! Execution is strictly sequential: no step starts before the previous
//! one's outcome (success or classified non-fatal failure) is known.

pub mod steps;

use async_trait::async_trait;

use crate::classify::{Classification, FailureRecord, FaultClassifier};
use crate::context::ProvisioningContext;
use crate::daemon::VmDaemon;
use crate::errors::{ProvisionError, ProvisionResult};
use crate::exec::Executor;
use crate::recovery::{RecoveryProcedure, RecoveryTuning};

/// Everything a step needs: the run context plus the shared collaborators.
pub struct StepEnv {
    pub ctx: ProvisioningContext,
    pub exec: Executor,
    pub daemon: VmDaemon,
    pub recovery: RecoveryProcedure,
}

impl StepEnv {
    pub fn new(ctx: ProvisioningContext, exec: Executor, tuning: RecoveryTuning) -> Self {
        let daemon = VmDaemon::new(exec.clone());
        let recovery = RecoveryProcedure::new(exec.clone(), tuning);
        Self {
            ctx,
            exec,
            daemon,
            recovery,
        }
    }
}

/// One idempotent unit of provisioning work.
///
/// Every step must be safe to re-run from scratch: resumption always
/// re-executes the selected step and everything after it, even if a
/// previous run partially completed it.
#[async_trait]
pub trait ProvisionStep: Send + Sync {
    /// Stable identifier, unique within the table.
    fn id(&self) -> &'static str;

    /// Human-readable menu label.
    fn label(&self) -> String;

    /// True when the step drives the recovery procedure itself. The
    /// driver then skips its automatic recovery pass on a daemon fault
    /// from this step, so the instance is not purged a second time.
    fn handles_recovery(&self) -> bool {
        false
    }

    async fn run(&self, env: &StepEnv) -> ProvisionResult<()>;
}

pub type BoxedStep = Box<dyn ProvisionStep>;

/// Resumption entry point, expressed as a pipeline index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPoint(usize);

impl StartPoint {
    /// Map a menu selection to a pipeline index.
    ///
    /// Selection 0 is "run everything"; selection `s >= 1` names the
    /// step at index `s - 1`. Total function over valid selections;
    /// anything past the table is rejected at the input boundary.
    pub fn from_menu_choice(choice: usize, step_count: usize) -> ProvisionResult<Self> {
        match choice {
            0 => Ok(StartPoint(0)),
            s if s <= step_count => Ok(StartPoint(s - 1)),
            s => Err(ProvisionError::Input(format!(
                "menu choice {s} out of range (1..={step_count})"
            ))),
        }
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Menu entries derived from the step table, "from the beginning" first.
pub fn menu_labels(steps: &[BoxedStep]) -> Vec<String> {
    let mut labels = vec!["Start from the very beginning (all steps)".to_string()];
    labels.extend(steps.iter().map(|s| s.label()));
    labels
}

/// Sequential pipeline driver with classified failure handling.
pub struct Pipeline {
    steps: Vec<BoxedStep>,
    classifier: FaultClassifier,
}

impl Pipeline {
    pub fn new(steps: Vec<BoxedStep>, classifier: FaultClassifier) -> Self {
        Self { steps, classifier }
    }

    pub fn steps(&self) -> &[BoxedStep] {
        &self.steps
    }

    /// Execute steps `[start, end)`.
    ///
    /// A failing step is classified: Fatal aborts the run with the
    /// original error; NonFatal logs a warning and the run continues
    /// (later steps cannot assume the failed step's postconditions).
    /// A `DaemonUnresponsive` failure triggers the recovery procedure
    /// and a fresh liveness probe before the classifier is consulted.
    pub async fn run(&self, env: &StepEnv, start: StartPoint) -> ProvisionResult<()> {
        for step in &self.steps[start.index()..] {
            tracing::info!(step = step.id(), "running step");
            let Err(err) = step.run(env).await else {
                tracing::info!(step = step.id(), "step complete");
                continue;
            };

            if err.is_daemon_unresponsive() {
                if step.handles_recovery() {
                    tracing::warn!(step = step.id(), "daemon still down after the step's own recovery");
                } else {
                    tracing::warn!(step = step.id(), error = %err, "daemon fault during step, recovering");
                    let _outcomes = env.recovery.run(&env.ctx).await;
                    if env.recovery.is_responsive().await {
                        tracing::info!("daemon responsive again after recovery");
                    } else {
                        tracing::warn!("daemon still unresponsive after recovery");
                    }
                }
            }

            let record = FailureRecord::new(step.id(), &err, self.classifier.classify(&err));
            match record.classification {
                Classification::Fatal => {
                    tracing::error!(
                        step = %record.step,
                        error = %record.message,
                        "fatal step failure, aborting run"
                    );
                    return Err(err);
                }
                Classification::NonFatal => {
                    tracing::warn!(
                        step = %record.step,
                        error = %record.message,
                        "non-fatal step failure, continuing to next step"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::context::Secret;
    use crate::exec::fake::FakeRunner;

    struct ScriptedStep {
        id: &'static str,
        error: Option<fn() -> ProvisionError>,
        recovers: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ProvisionStep for ScriptedStep {
        fn id(&self) -> &'static str {
            self.id
        }

        fn label(&self) -> String {
            self.id.to_string()
        }

        fn handles_recovery(&self) -> bool {
            self.recovers
        }

        async fn run(&self, _env: &StepEnv) -> ProvisionResult<()> {
            self.log.lock().unwrap().push(self.id);
            match self.error {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    fn test_env(runner: Arc<FakeRunner>) -> StepEnv {
        let ctx = ProvisioningContext::with_paths(
            "node-a".into(),
            Secret::new("pw"),
            Path::new("/tmp/keys"),
            PathBuf::from("inventory.ini"),
            PathBuf::from("values.json"),
        );
        StepEnv::new(ctx, Executor::with_runner(runner), RecoveryTuning::instant())
    }

    fn scripted(
        specs: &[(&'static str, Option<fn() -> ProvisionError>)],
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Vec<BoxedStep> {
        specs
            .iter()
            .copied()
            .map(|(id, error)| {
                Box::new(ScriptedStep {
                    id,
                    error,
                    recovers: false,
                    log: Arc::clone(log),
                }) as BoxedStep
            })
            .collect()
    }

    #[test]
    fn menu_choice_maps_to_step_range() {
        let n = 19;
        assert_eq!(StartPoint::from_menu_choice(0, n).unwrap().index(), 0);
        for s in 1..=n {
            assert_eq!(StartPoint::from_menu_choice(s, n).unwrap().index(), s - 1);
        }
        assert!(StartPoint::from_menu_choice(n + 1, n).is_err());
    }

    #[test]
    fn menu_is_derived_from_the_step_table() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = scripted(&[("one", None), ("two", None)], &log);
        let labels = menu_labels(&steps);
        assert_eq!(labels.len(), 3);
        assert!(labels[0].contains("very beginning"));
        assert_eq!(labels[1], "one");
        assert_eq!(labels[2], "two");
    }

    #[tokio::test]
    async fn resumption_skips_earlier_steps() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = scripted(&[("a", None), ("b", None), ("c", None)], &log);
        let pipeline = Pipeline::new(steps, FaultClassifier::default());
        let env = test_env(Arc::new(FakeRunner::succeeding()));

        let start = StartPoint::from_menu_choice(2, 3).unwrap();
        pipeline.run(&env, start).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn non_fatal_failure_continues_fatal_aborts() {
        fn benign() -> ProvisionError {
            ProvisionError::NonZeroExit {
                code: Some(2),
                stderr: "Vault is already initialized".into(),
            }
        }
        fn fatal() -> ProvisionError {
            ProvisionError::NonZeroExit {
                code: Some(1),
                stderr: "unexpected explosion".into(),
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = scripted(
            &[
                ("soft_fail", Some(benign)),
                ("hard_fail", Some(fatal)),
                ("never_runs", None),
            ],
            &log,
        );
        let pipeline = Pipeline::new(steps, FaultClassifier::default());
        let env = test_env(Arc::new(FakeRunner::succeeding()));

        let err = pipeline
            .run(&env, StartPoint::from_menu_choice(0, 3).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::NonZeroExit { code: Some(1), .. }));
        assert_eq!(*log.lock().unwrap(), vec!["soft_fail", "hard_fail"]);
    }

    #[tokio::test]
    async fn daemon_fault_triggers_recovery_before_classification() {
        fn daemon_down() -> ProvisionError {
            ProvisionError::DaemonUnresponsive("list timed out".into())
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = scripted(&[("probe_step", Some(daemon_down))], &log);
        let pipeline = Pipeline::new(steps, FaultClassifier::default());
        let runner = Arc::new(FakeRunner::succeeding());
        let env = test_env(Arc::clone(&runner));

        // Unknown failure: conservative default is Fatal.
        let err = pipeline
            .run(&env, StartPoint::from_menu_choice(0, 1).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_daemon_unresponsive());

        // Remediation ran, and a fresh probe followed it.
        assert_eq!(runner.call_count("multipass stop --all"), 1);
        assert_eq!(runner.call_count("delete node-a --purge"), 1);
        assert_eq!(runner.call_count("multipass list"), 1);
    }

    #[tokio::test]
    async fn recovery_gated_step_failure_skips_the_automatic_recovery_pass() {
        fn daemon_down() -> ProvisionError {
            ProvisionError::DaemonUnresponsive("still down after recovery".into())
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let step = Box::new(ScriptedStep {
            id: "gate",
            error: Some(daemon_down),
            recovers: true,
            log: Arc::clone(&log),
        }) as BoxedStep;
        let pipeline = Pipeline::new(vec![step], FaultClassifier::default());
        let runner = Arc::new(FakeRunner::succeeding());
        let env = test_env(Arc::clone(&runner));

        let err = pipeline
            .run(&env, StartPoint::from_menu_choice(0, 1).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_daemon_unresponsive());

        // The step already drove recovery itself; the driver must not
        // stop or purge the instance a second time.
        assert!(runner.calls().is_empty(), "{:?}", runner.calls());
    }
}
