//! Shell-based step execution on the host.

use crate::runner::{OutputLine, OutputStream, RunnerConfig, StepContext, StepResult, StepRunner};
use async_trait::async_trait;
use kiln_core::pipeline::{Shell, StepDefinition};
use kiln_core::{Error, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Program and arguments that run `script` under `shell`.
pub fn shell_invocation(shell: Shell, script: &str) -> (&'static str, Vec<String>) {
    let args: &[&str] = match shell {
        Shell::Bash => &["--noprofile", "--norc", "-e", "-o", "pipefail", "-c"],
        Shell::Sh => &["-e", "-c"],
        Shell::Pwsh => &["-NoLogo", "-NoProfile", "-NonInteractive", "-Command"],
        Shell::Powershell => &[
            "-NoLogo",
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
        ],
        Shell::Cmd => &["/D", "/E:ON", "/V:OFF", "/S", "/C"],
        Shell::Python => &["-c"],
    };

    let mut args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    args.push(script.to_string());
    (shell.as_str(), args)
}

/// Shell runner for executing commands on the host.
pub struct ShellRunner {
    config: RunnerConfig,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn default_shell(&self) -> Shell {
        self.config.default_shell
    }

    async fn execute_command(
        &self,
        script: &str,
        shell: Shell,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let start = std::time::Instant::now();
        let working_dir = ctx.working_dir();
        let (program, args) = shell_invocation(shell, script);

        info!(%shell, working_dir = %working_dir.display(), "Executing shell command");

        let mut child = Command::new(program)
            .args(&args)
            .current_dir(&working_dir)
            .envs(&ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Execution(format!("Failed to spawn {}: {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr was not captured".to_string()))?;

        let stdout_handle = forward_lines(stdout, OutputStream::Stdout, output_tx.clone());
        let stderr_handle = forward_lines(stderr, OutputStream::Stderr, output_tx);

        // Instance timeouts drop this future; kill_on_drop reaps the child.
        let wait_result = child.wait().await;

        // Wait for output streaming to complete
        let _ = stdout_handle.await;
        let _ = stderr_handle.await;

        let status =
            wait_result.map_err(|e| Error::Execution(format!("Failed to wait for process: {}", e)))?;

        let exit_code = status.code();
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(?exit_code, duration_ms, "Command completed");

        Ok(StepResult {
            exit_code,
            success: status.success(),
            duration_ms,
        })
    }
}

fn forward_lines<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<OutputLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut line_num = 0u32;
        let mut forwarding = true;

        // Drain to EOF even when lines cannot be forwarded, so the child
        // never writes into a closed pipe.
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(?stream, error = %e, "Failed to read step output");
                    break;
                }
            }
            if !forwarding {
                continue;
            }

            line_num += 1;
            let content = String::from_utf8_lossy(&buf);
            let output = OutputLine {
                stream,
                content: content.trim_end_matches(['\n', '\r']).to_string(),
                line_number: line_num,
                timestamp: chrono::Utc::now(),
            };
            forwarding = tx.send(output).await.is_ok();
        }
    })
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let script = ctx
            .step
            .run
            .as_ref()
            .ok_or_else(|| Error::Execution("No command to run".to_string()))?;
        let shell = ctx.step.shell.unwrap_or(self.config.default_shell);

        self.execute_command(script, shell, ctx, output_tx).await
    }

    fn can_handle(&self, step: &StepDefinition) -> bool {
        step.run.is_some() && step.uses.is_none()
    }
}
