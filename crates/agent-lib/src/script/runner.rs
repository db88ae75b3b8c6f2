//! Script process runner
//!
//! Spawns the interpreter with the resolved script and parameters, drains
//! stdout/stderr into bounded buffers while the process runs, and kills the
//! whole process tree on timeout or cancellation.

use super::{resolve_script_path, ScriptLauncher, ScriptOutput, ScriptRequest};
use crate::config::ScriptSettings;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for pipe readers to finish after the process is gone
const OUTPUT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Read chunk size for stdout/stderr
const READ_CHUNK: usize = 8192;

/// Configuration for the script runner
#[derive(Debug, Clone)]
pub struct ScriptRunnerConfig {
    /// Directory every script must resolve into
    pub scripts_dir: PathBuf,
    /// Interpreter executable (e.g. "powershell.exe")
    pub interpreter: String,
    /// Arguments placed before the script path
    pub interpreter_args: Vec<String>,
    /// Prefix for each parameter name ("--Param value")
    pub param_prefix: String,
    /// Default wall-clock timeout
    pub timeout: Duration,
    /// Cap on captured bytes for each of stdout and stderr
    pub max_output_bytes: usize,
}

impl ScriptRunnerConfig {
    pub fn from_settings(scripts_dir: impl Into<PathBuf>, settings: &ScriptSettings) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            interpreter: settings.interpreter.clone(),
            interpreter_args: settings.interpreter_args.clone(),
            param_prefix: settings.param_prefix.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            max_output_bytes: settings.max_output_bytes,
        }
    }
}

/// How a running process came to an end
enum Termination {
    Exited(std::process::ExitStatus),
    TimedOut(Duration),
    Cancelled,
}

/// Runs scripts as child processes
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    config: ScriptRunnerConfig,
}

impl ScriptRunner {
    pub fn new(config: ScriptRunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScriptRunnerConfig {
        &self.config
    }

    /// Build the interpreter command line for a resolved script
    fn build_command(&self, script_path: &std::path::Path, params: &[(String, String)]) -> Command {
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.interpreter_args).arg(script_path);
        for (name, value) in params {
            cmd.arg(format!("{}{}", self.config.param_prefix, name))
                .arg(value);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // New process group so a timeout can take down grandchildren too
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    async fn run_inner(
        &self,
        request: ScriptRequest,
        cancel: CancellationToken,
    ) -> Result<ScriptOutput> {
        let script_path = resolve_script_path(&self.config.scripts_dir, &request.script).await?;
        let timeout = request.timeout.unwrap_or(self.config.timeout);

        debug!(
            script = %request.script,
            path = %script_path.display(),
            params = request.params.len(),
            "Spawning script"
        );

        let start = Instant::now();
        let mut child = self
            .build_command(&script_path, &request.params)
            .spawn()
            .map_err(|source| EngineError::ScriptSpawn {
                script: request.script.clone(),
                source,
            })?;

        let limit = self.config.max_output_bytes;
        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(read_bounded(s, limit)));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(read_bounded(s, limit)));

        let termination = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|source| EngineError::ScriptSpawn {
                    script: request.script.clone(),
                    source,
                })?;
                Termination::Exited(status)
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(script = %request.script, timeout_secs = timeout.as_secs(), "Script timed out, killing process tree");
                kill_process_tree(&mut child).await;
                Termination::TimedOut(timeout)
            }
            _ = cancel.cancelled() => {
                info!(script = %request.script, "Script cancelled, killing process tree");
                kill_process_tree(&mut child).await;
                Termination::Cancelled
            }
        };

        let (stdout, stdout_truncated) = collect(stdout_task).await;
        let (stderr, stderr_truncated) = collect(stderr_task).await;

        let mut output = ScriptOutput {
            exit_code: None,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            duration: start.elapsed(),
        };

        match termination {
            Termination::Exited(status) => {
                output.exit_code = status.code();
                if status.success() {
                    Ok(output)
                } else {
                    Err(EngineError::ScriptExecution {
                        script: request.script,
                        exit_code: status.code().unwrap_or(crate::models::SYNTHETIC_EXIT_CODE),
                        output: Box::new(output),
                    })
                }
            }
            Termination::TimedOut(timeout) => Err(EngineError::ScriptTimeout {
                script: request.script,
                timeout,
                output: Box::new(output),
            }),
            Termination::Cancelled => Err(EngineError::Cancelled {
                script: request.script,
                output: Box::new(output),
            }),
        }
    }
}

#[async_trait]
impl ScriptLauncher for ScriptRunner {
    async fn run(&self, request: ScriptRequest, cancel: CancellationToken) -> Result<ScriptOutput> {
        self.run_inner(request, cancel).await
    }
}

/// Kill the child and everything it spawned
async fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!(pid, error = %e, "killpg failed");
            }
        }
    }

    #[cfg(windows)]
    {
        if let Some(pid) = child.id() {
            let result = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = result {
                debug!(pid, error = %e, "taskkill failed");
            }
        }
    }

    // Reaps the direct child; harmless if the group kill already did
    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill after tree termination failed");
    }
}

/// Drain a pipe to EOF, keeping at most `limit` bytes
///
/// Reading continues past the limit so the child never blocks on a full pipe.
async fn read_bounded<R: AsyncRead + Unpin>(mut stream: R, limit: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut truncated = false;

    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let take = n.min(limit.saturating_sub(buf.len()));
                buf.extend_from_slice(&chunk[..take]);
                if take < n {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }

    (buf, truncated)
}

async fn collect(task: Option<tokio::task::JoinHandle<(Vec<u8>, bool)>>) -> (String, bool) {
    let Some(task) = task else {
        return (String::new(), false);
    };

    match tokio::time::timeout(OUTPUT_COLLECTION_TIMEOUT, task).await {
        Ok(Ok((bytes, truncated))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Ok(Err(e)) => {
            debug!(error = %e, "Output reader task failed");
            (String::new(), false)
        }
        Err(_) => ("[output collection timed out]".to_string(), true),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner(dir: &TempDir, timeout: Duration, max_output_bytes: usize) -> ScriptRunner {
        ScriptRunner::new(ScriptRunnerConfig {
            scripts_dir: dir.path().to_path_buf(),
            interpreter: "sh".to_string(),
            interpreter_args: Vec::new(),
            param_prefix: "--".to_string(),
            timeout,
            max_output_bytes,
        })
    }

    async fn write_script(dir: &TempDir, name: &str, body: &str) {
        tokio::fs::write(dir.path().join(name), body).await.unwrap();
    }

    #[tokio::test]
    async fn test_passes_prefixed_parameters() {
        let dir = TempDir::new().unwrap();
        write_script(&dir, "echo.sh", "echo \"$@\"\n").await;
        let runner = runner(&dir, Duration::from_secs(10), 4096);

        let output = runner
            .run(
                ScriptRequest::new("echo.sh")
                    .param("User", "alice")
                    .param("Reason", "too many attempts"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout.trim(), "--User alice --Reason too many attempts");
        assert!(!output.truncated());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_execution_error() {
        let dir = TempDir::new().unwrap();
        write_script(&dir, "fail.sh", "echo boom >&2\nexit 3\n").await;
        let runner = runner(&dir, Duration::from_secs(10), 4096);

        let err = runner
            .run(ScriptRequest::new("fail.sh"), CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            EngineError::ScriptExecution {
                exit_code, output, ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(output.stderr.trim(), "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = TempDir::new().unwrap();
        // Child sleep keeps the pipe open unless the whole group dies
        write_script(&dir, "hang.sh", "echo started\nsleep 30 &\nsleep 30\n").await;
        let runner = runner(&dir, Duration::from_millis(300), 4096);

        let start = Instant::now();
        let err = runner
            .run(ScriptRequest::new("hang.sh"), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(5));
        match err {
            EngineError::ScriptTimeout { output, timeout, .. } => {
                assert_eq!(timeout, Duration::from_millis(300));
                assert!(output.exit_code.is_none());
                assert_eq!(output.stdout.trim(), "started");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_request_timeout_overrides_default() {
        let dir = TempDir::new().unwrap();
        write_script(&dir, "slow.sh", "sleep 30\n").await;
        let runner = runner(&dir, Duration::from_secs(60), 4096);

        let err = runner
            .run(
                ScriptRequest::new("slow.sh").timeout(Duration::from_millis(200)),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "script_timeout_error");
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let dir = TempDir::new().unwrap();
        write_script(&dir, "slow.sh", "sleep 30\n").await;
        let runner = runner(&dir, Duration::from_secs(60), 4096);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let err = runner
            .run(ScriptRequest::new("slow.sh"), cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        let dir = TempDir::new().unwrap();
        write_script(
            &dir,
            "noisy.sh",
            "i=0\nwhile [ $i -lt 2000 ]; do echo 0123456789abcdef; i=$((i+1)); done\n",
        )
        .await;
        let runner = runner(&dir, Duration::from_secs(10), 100);

        let output = runner
            .run(ScriptRequest::new("noisy.sh"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.stdout.len(), 100);
        assert!(output.stdout_truncated);
        assert!(!output.stderr_truncated);
    }

    #[tokio::test]
    async fn test_path_violation_never_spawns() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, Duration::from_secs(10), 4096);

        let err = runner
            .run(
                ScriptRequest::new("..\\..\\Windows\\System32\\x.ps1"),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PathViolation { .. }));
    }
}
