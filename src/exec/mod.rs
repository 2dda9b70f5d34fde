//! External command execution.
//!
//! Every provisioning step goes through [`Executor`], which logs each
//! invocation and outcome before returning, so a failed run is always
//! diagnosable from the log alone. The actual process handling lives
//! behind the [`CommandRunner`] trait; production uses [`host::HostRunner`],
//! tests script outcomes with a fake.

mod host;

#[cfg(test)]
pub(crate) mod fake;

pub use host::HostRunner;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::Secret;
use crate::errors::{ProvisionError, ProvisionResult};

/// Default bound for captured (non-interactive) commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// How a command's output is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Buffer stdout/stderr; stdout is returned trimmed. Bounded by a
    /// timeout (180s default).
    Captured,
    /// Inherit the controlling terminal for attended, long-running
    /// operations. No capture, no bound; success is exit-status only.
    Streamed,
}

/// A single external command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub mode: ExecMode,
    pub timeout: Option<Duration>,
    /// Piped to the child's stdin. Used to feed the elevation credential
    /// to `sudo -S` so it never appears in a process listing.
    pub stdin_data: Option<Secret>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            mode: ExecMode::Captured,
            timeout: Some(DEFAULT_TIMEOUT),
            stdin_data: None,
            env: Vec::new(),
        }
    }

    /// A `/bin/sh -c` invocation for commands that need shell plumbing.
    pub fn shell(line: impl Into<String>) -> Self {
        Self::new("/bin/sh", ["-c".to_string(), line.into()])
    }

    pub fn streamed(mut self) -> Self {
        self.mode = ExecMode::Streamed;
        self.timeout = None;
        self
    }

    pub fn timeout(mut self, bound: Duration) -> Self {
        self.timeout = Some(bound);
        self
    }

    pub fn stdin_secret(mut self, secret: Secret) -> Self {
        self.stdin_data = Some(secret);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command text for logging. Secrets travel via stdin or environment,
    /// never argv, so this is safe to log verbatim.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Raw outcome of a finished (or timed-out) command.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }
}

/// Runs a command to completion and reports the raw result.
///
/// Implementations return `Err` only for environment-level failures
/// (spawn errors, I/O); a command that ran but failed or timed out is an
/// `Ok(ExecutionResult)` — the [`Executor`] converts those to errors.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec) -> ProvisionResult<ExecutionResult>;
}

/// Command-execution facade shared by every step.
#[derive(Clone)]
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
}

impl Executor {
    /// Executor backed by real host processes.
    pub fn host() -> Self {
        Self::with_runner(Arc::new(HostRunner))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Run a command; timeout and non-zero exit become errors.
    pub async fn run(&self, spec: CommandSpec) -> ProvisionResult<ExecutionResult> {
        let command = spec.display();
        let timeout = spec.timeout;
        tracing::info!(command = %command, "running command");

        let result = match self.runner.run(spec).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(command = %command, error = %err, "command could not be run");
                return Err(err);
            }
        };

        if result.timed_out {
            let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
            tracing::error!(command = %command, ?timeout, "command timed out");
            return Err(ProvisionError::Timeout { command, timeout });
        }
        if !result.success() {
            tracing::error!(
                command = %command,
                code = ?result.code,
                stderr = %result.stderr,
                "command failed"
            );
            return Err(ProvisionError::NonZeroExit {
                code: result.code,
                stderr: result.stderr,
            });
        }

        tracing::debug!(command = %command, stdout = %result.stdout, "command succeeded");
        Ok(result)
    }

    /// Run a captured command and return its trimmed stdout.
    pub async fn capture(&self, spec: CommandSpec) -> ProvisionResult<String> {
        Ok(self.run(spec).await?.stdout)
    }

    /// Run an interactive command with inherited stdio.
    pub async fn stream(&self, spec: CommandSpec) -> ProvisionResult<()> {
        self.run(spec.streamed()).await.map(|_| ())
    }

    /// Run a shell command under privilege elevation, piping the
    /// credential to the elevation prompt on stdin. `-k` drops any
    /// cached authorization first, so the prompt always consumes the
    /// credential line instead of leaving it on the child's stdin.
    pub async fn elevated(&self, line: &str, credential: &Secret) -> ProvisionResult<String> {
        let spec = CommandSpec::new(
            "sudo",
            ["-S", "-k", "-p", "", "--", "/bin/sh", "-c", line],
        )
        .stdin_secret(credential.clone());
        self.capture(spec).await
    }

    /// Write content to a root-owned file under privilege elevation.
    ///
    /// The payload is staged through a private temp file and copied into
    /// place, so only the credential ever rides on sudo's stdin. Piping
    /// both down one stream would let a non-prompting sudo pass the
    /// credential line through into the target file.
    pub async fn elevated_write(
        &self,
        content: &str,
        path: &str,
        credential: &Secret,
    ) -> ProvisionResult<()> {
        let staging = tempfile::NamedTempFile::new()?;
        fs::write(staging.path(), content)?;
        let staged = staging.path().display();
        self.elevated(
            &format!("cp '{staged}' '{path}' && chmod 600 '{path}'"),
            credential,
        )
        .await
        .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Executor {
        Executor::host()
    }

    #[tokio::test]
    async fn captured_stdout_is_trimmed() {
        let out = host()
            .capture(CommandSpec::shell("echo '  hello  '"))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn timeout_yields_timeout_not_nonzero_exit() {
        let spec = CommandSpec::shell("sleep 5").timeout(Duration::from_millis(100));
        let err = host().run(spec).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn nonzero_exit_carries_code_and_stderr() {
        let spec = CommandSpec::shell("echo boom >&2; exit 3");
        match host().run(spec).await.unwrap_err() {
            ProvisionError::NonZeroExit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stdin_data_is_piped_to_child() {
        let spec = CommandSpec::new("cat", Vec::<String>::new())
            .stdin_secret(Secret::new("s3cret"));
        let out = host().capture(spec).await.unwrap();
        assert_eq!(out, "s3cret");
    }

    #[tokio::test]
    async fn elevated_write_keeps_payload_off_the_credential_stream() {
        use std::sync::Mutex;

        use crate::exec::fake::{FakeRunner, ok_result};

        let observed: Arc<Mutex<Vec<(String, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&observed);
        let runner = Arc::new(FakeRunner::new(move |spec| {
            let stdin = spec
                .stdin_data
                .as_ref()
                .map(|s| s.expose().to_string())
                .unwrap_or_default();
            let line = spec.args.last().cloned().unwrap_or_default();
            // Staged file only lives for the duration of the call.
            let staged = line
                .split('\'')
                .nth(1)
                .map(|p| std::fs::read_to_string(p).unwrap_or_default())
                .unwrap_or_default();
            seen.lock().unwrap().push((stdin, staged, line));
            Ok(ok_result(""))
        }));

        let config = "[Interface]\nPrivateKey = KEY\n";
        Executor::with_runner(runner)
            .elevated_write(config, "/etc/wireguard/wg0.conf", &Secret::new("hunter2"))
            .await
            .unwrap();

        let observed = observed.lock().unwrap();
        assert_eq!(observed.len(), 1);
        let (stdin, staged, line) = &observed[0];
        // Even a sudo that never prompts cannot move the credential into
        // the target file: the payload arrives only via the staged copy.
        assert_eq!(stdin, "hunter2");
        assert_eq!(staged, config);
        assert!(line.contains("chmod 600 '/etc/wireguard/wg0.conf'"));
    }

    #[tokio::test]
    async fn streamed_mode_reports_exit_status_only() {
        host().stream(CommandSpec::shell("true")).await.unwrap();
        let err = host().stream(CommandSpec::shell("exit 7")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NonZeroExit { code: Some(7), .. }));
    }
}
