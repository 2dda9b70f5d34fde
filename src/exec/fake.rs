//! Scripted command runner for tests.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{CommandRunner, CommandSpec, ExecutionResult};
use crate::errors::ProvisionResult;

type Handler = Box<dyn Fn(&CommandSpec) -> ProvisionResult<ExecutionResult> + Send + Sync>;

/// Responds to commands via a scripted handler and records every
/// invocation's display text in order.
pub(crate) struct FakeRunner {
    handler: Handler,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub(crate) fn new(
        handler: impl Fn(&CommandSpec) -> ProvisionResult<ExecutionResult> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every command succeeds with empty output.
    pub(crate) fn succeeding() -> Self {
        Self::new(|_| Ok(ok_result("")))
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: CommandSpec) -> ProvisionResult<ExecutionResult> {
        self.calls.lock().unwrap().push(spec.display());
        (self.handler)(&spec)
    }
}

pub(crate) fn ok_result(stdout: &str) -> ExecutionResult {
    ExecutionResult {
        stdout: stdout.to_string(),
        stderr: String::new(),
        code: Some(0),
        timed_out: false,
    }
}

pub(crate) fn failed_result(code: i32, stderr: &str) -> ExecutionResult {
    ExecutionResult {
        stdout: String::new(),
        stderr: stderr.to_string(),
        code: Some(code),
        timed_out: false,
    }
}

pub(crate) fn timed_out_result() -> ExecutionResult {
    ExecutionResult {
        timed_out: true,
        ..Default::default()
    }
}
