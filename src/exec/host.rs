//! Host process implementation of [`CommandRunner`].

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{CommandRunner, CommandSpec, ExecMode, ExecutionResult};
use crate::errors::{ProvisionError, ProvisionResult};

/// Runs commands as real host subprocesses via `tokio::process`.
pub struct HostRunner;

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, spec: CommandSpec) -> ProvisionResult<ExecutionResult> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        match spec.mode {
            ExecMode::Streamed => run_streamed(cmd).await,
            ExecMode::Captured => run_captured(cmd, &spec).await,
        }
    }
}

/// Attended mode: the operator watches progress on the controlling
/// terminal, so stdio is inherited and there is no execution bound.
async fn run_streamed(mut cmd: Command) -> ProvisionResult<ExecutionResult> {
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let status = cmd.status().await.map_err(spawn_error)?;
    Ok(ExecutionResult {
        code: status.code(),
        ..Default::default()
    })
}

async fn run_captured(mut cmd: Command, spec: &CommandSpec) -> ProvisionResult<ExecutionResult> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if spec.stdin_data.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    // If the wait future is dropped at the timeout boundary, the child
    // must not outlive it.
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(spawn_error)?;

    if let Some(secret) = &spec.stdin_data {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProvisionError::Internal("child stdin was not piped".into()))?;
        stdin.write_all(secret.expose().as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.shutdown().await?;
    }

    let output = match spec.timeout {
        Some(bound) => match tokio::time::timeout(bound, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Ok(ExecutionResult {
                    timed_out: true,
                    ..Default::default()
                });
            }
        },
        None => child.wait_with_output().await?,
    };

    Ok(ExecutionResult {
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        code: output.status.code(),
        timed_out: false,
    })
}

fn spawn_error(err: std::io::Error) -> ProvisionError {
    ProvisionError::Internal(format!("failed to spawn command: {err}"))
}
