//! Per-instance execution.

use crate::capabilities::{Capability, CapabilityCall, CapabilityTable};
use crate::runner::{OutputLine, OutputStream, RunnerConfig, StepContext, StepRunner};
use crate::shell::ShellRunner;
use crate::workspace::{Workspace, WorkspaceSource};
use async_trait::async_trait;
use kiln_cache::{
    CacheFingerprint, CacheProvider, CacheRestoreRequest, CacheSaveRequest, CompressionType,
};
use kiln_core::env::EnvLayers;
use kiln_core::instance::JobInstance;
use kiln_core::pipeline::{CacheSpec, Shell, StepAction, StepDefinition};
use kiln_core::ports::InstanceExecutor;
use kiln_core::run::{CacheReport, ExecutionReport, RunContext, StepReport, StepStatus};
use kiln_core::{Error, Result};
use kiln_trace::{CiAttributes, cache_span, step_span};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{Instrument, Span, error, info, warn};

/// Configuration for the execution context.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Directory under which per-instance workspaces are created.
    pub workspace_root: PathBuf,
    pub source: WorkspaceSource,
    pub default_shell: Shell,
    pub keep_workspaces: bool,
    /// Prefix of job cache keys unless the job names its own.
    pub cache_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("kiln-workspaces"),
            source: WorkspaceSource::Empty,
            default_shell: Shell::platform_default(),
            keep_workspaces: false,
            cache_prefix: "kiln".to_string(),
        }
    }
}

/// Runs job instances on the host.
pub struct ExecutionContext {
    config: ExecutorConfig,
    cache: Arc<dyn CacheProvider>,
    capabilities: CapabilityTable,
    shell: ShellRunner,
}

impl ExecutionContext {
    pub fn new(config: ExecutorConfig, cache: Arc<dyn CacheProvider>) -> Self {
        let capabilities = CapabilityTable::with_builtins(config.source.clone(), cache.clone());
        let shell = ShellRunner::new(RunnerConfig {
            default_shell: config.default_shell,
        });
        Self {
            config,
            cache,
            capabilities,
            shell,
        }
    }

    /// Add a capability to the step resolution table.
    pub fn with_capability(mut self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.register(capability);
        self
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// Pipeline and job env, then the engine's own variables.
    fn instance_env(&self, instance: &JobInstance, run: &RunContext, workspace: &Path) -> EnvLayers {
        let mut engine: HashMap<String, String> = HashMap::new();
        engine.insert("CI".into(), "true".into());
        engine.insert("KILN".into(), "true".into());
        engine.insert("KILN_WORKSPACE".into(), workspace.display().to_string());
        engine.insert("KILN_JOB".into(), instance.job.clone());
        engine.insert("KILN_INSTANCE".into(), instance.display_name.clone());
        engine.insert("KILN_RUNNER_OS".into(), instance.runs_on.clone());
        engine.insert("KILN_RUN_ID".into(), run.run_id.to_string());
        engine.insert("KILN_EVENT".into(), run.event.kind.to_string());
        if let Some(git_ref) = &run.event.branch_ref {
            engine.insert("KILN_REF".into(), git_ref.clone());
        }
        if let Some(sha) = &run.event.sha {
            engine.insert("KILN_SHA".into(), sha.clone());
        }
        for (axis, value) in instance.binding.iter() {
            engine.insert(matrix_var(axis), value.to_string());
        }

        instance.env.clone().with_layer(&engine)
    }

    fn cache_key(&self, instance: &JobInstance, spec: &CacheSpec, workspace: &Path) -> (String, String) {
        let prefix = spec.prefix.as_deref().unwrap_or(&self.config.cache_prefix);
        let fingerprint = CacheFingerprint::compute(
            &instance.runs_on,
            spec.toolchain.as_deref(),
            workspace,
            &spec.lock_files,
        );
        let key = fingerprint.key(prefix);
        let fallback = key
            .strip_suffix(fingerprint.lock_hash.as_str())
            .unwrap_or(&key)
            .to_string();
        (key, fallback)
    }

    async fn restore_cache(&self, key: &str, fallback: &str, workspace: &Path) -> Result<bool> {
        let request = CacheRestoreRequest {
            key: key.to_string(),
            restore_keys: vec![fallback.to_string()],
            destination: workspace.to_path_buf(),
        };
        let result = self
            .cache
            .restore(&request)
            .instrument(cache_span("restore", key))
            .await?;
        Ok(result.is_hit())
    }

    async fn save_cache(&self, key: &str, spec: &CacheSpec, workspace: &Path) -> bool {
        let request = CacheSaveRequest {
            key: key.to_string(),
            paths: spec.paths.iter().map(PathBuf::from).collect(),
            base_dir: workspace.to_path_buf(),
            compression: CompressionType::Zstd,
        };
        match self
            .cache
            .save(&request)
            .instrument(cache_span("save", key))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(key, error = %e, "Cache save failed");
                false
            }
        }
    }

    async fn run_step(
        &self,
        instance: &JobInstance,
        index: usize,
        step: &StepDefinition,
        env: &EnvLayers,
        workspace: &Path,
    ) -> Result<StepReport> {
        let start = Instant::now();
        let name = step.label();
        let step_env = env.clone().with_layer(&step.env).resolve();

        info!(step = %name, index, "Executing step");

        let (status, exit_code, error) = match step.action(&instance.job, index)? {
            StepAction::Command { .. } => {
                let ctx = StepContext {
                    workspace: workspace.to_path_buf(),
                    env: step_env,
                    step: step.clone(),
                };
                match self.run_command(&ctx, &instance.display_name).await {
                    Ok(result) if result.success => (StepStatus::Succeeded, result.exit_code, None),
                    Ok(result) => (StepStatus::Failed, result.exit_code, None),
                    Err(e) => (StepStatus::Failed, None, Some(e.to_string())),
                }
            }
            StepAction::Capability { reference, inputs } => {
                match self.capabilities.resolve(&reference) {
                    None => (
                        StepStatus::Failed,
                        None,
                        Some(Error::UnknownCapability(reference).to_string()),
                    ),
                    Some((reference, capability)) => {
                        let call = CapabilityCall {
                            reference,
                            inputs,
                            env: step_env,
                            workspace: workspace.to_path_buf(),
                            step_name: name.clone(),
                            runs_on: instance.runs_on.clone(),
                        };
                        match capability.invoke(&call).await {
                            Ok(output) if output.success => {
                                (StepStatus::Succeeded, Some(output.exit_code), output.error)
                            }
                            Ok(output) => (StepStatus::Failed, Some(output.exit_code), output.error),
                            Err(e) => (StepStatus::Failed, None, Some(e.to_string())),
                        }
                    }
                }
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match status {
            StepStatus::Failed => {
                error!(step = %name, ?exit_code, error = error.as_deref().unwrap_or(""), "Step failed")
            }
            _ => info!(step = %name, duration_ms, "Step completed successfully"),
        }

        Ok(StepReport {
            index,
            name,
            status,
            exit_code,
            duration_ms,
            error,
        })
    }

    /// Run a shell step, forwarding its output into the log line by line.
    async fn run_command(&self, ctx: &StepContext, instance: &str) -> Result<crate::runner::StepResult> {
        let (tx, mut rx) = mpsc::channel::<OutputLine>(256);
        let label = instance.to_string();
        let forwarder = tokio::spawn(
            async move {
                while let Some(line) = rx.recv().await {
                    match line.stream {
                        OutputStream::Stdout => {
                            info!(target: "kiln::output", instance = %label, "{}", line.content)
                        }
                        OutputStream::Stderr => {
                            info!(target: "kiln::output", instance = %label, stream = "stderr", "{}", line.content)
                        }
                    }
                }
            }
            .instrument(Span::current()),
        );

        let result = self.shell.execute(ctx, tx).await;
        let _ = forwarder.await;
        result
    }
}

fn matrix_var(axis: &str) -> String {
    let normalized: String = axis
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("KILN_MATRIX_{}", normalized)
}

#[async_trait]
impl InstanceExecutor for ExecutionContext {
    async fn execute(&self, instance: &JobInstance, run: &RunContext) -> Result<ExecutionReport> {
        let workspace = Workspace::acquire(
            &self.config.workspace_root,
            &instance.display_name,
            &self.config.source,
            self.config.keep_workspaces,
        )
        .await?;
        let env = self.instance_env(instance, run, workspace.path());

        let mut cache = None;
        if let Some(spec) = &instance.cache {
            let (key, fallback) = self.cache_key(instance, spec, workspace.path());
            let restored = self.restore_cache(&key, &fallback, workspace.path()).await?;
            info!(key = %key, restored, "Cache lookup");
            cache = Some(CacheReport {
                key,
                restored,
                saved: false,
            });
        }

        let mut steps = Vec::with_capacity(instance.steps.len());
        let mut failed = false;
        for (index, step) in instance.steps.iter().enumerate() {
            if failed {
                steps.push(StepReport {
                    index,
                    name: step.label(),
                    status: StepStatus::Skipped,
                    exit_code: None,
                    duration_ms: 0,
                    error: None,
                });
                continue;
            }

            let attrs = CiAttributes::new()
                .instance(&instance.job, &instance.display_name, &instance.runs_on)
                .step(index, step.label());
            let report = self
                .run_step(instance, index, step, &env, workspace.path())
                .instrument(step_span(&attrs))
                .await?;
            failed = report.status == StepStatus::Failed;
            steps.push(report);
        }

        if !failed
            && let (Some(spec), Some(report)) = (&instance.cache, cache.as_mut())
        {
            report.saved = self.save_cache(&report.key, spec, workspace.path()).await;
        }

        drop(workspace);
        Ok(ExecutionReport { steps, cache })
    }
}
