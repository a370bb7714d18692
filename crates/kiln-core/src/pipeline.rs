//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration.
//! They are immutable once loaded; everything derived from them at run time
//! (instances, outcomes) lives in [`crate::instance`] and [`crate::run`].

use crate::error::{ConfigError, Result};
use schemars::JsonSchema;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "on")]
    pub triggers: Vec<TriggerRule>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub jobs: Vec<JobTemplate>,
}

impl PipelineDefinition {
    /// Parse a definition from YAML and validate it.
    pub fn from_yaml(source: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(source)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// JSON Schema describing the definition format.
    pub fn json_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(PipelineDefinition);
        serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
    }

    pub fn job(&self, name: &str) -> Option<&JobTemplate> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn job_index(&self, name: &str) -> Option<usize> {
        self.jobs.iter().position(|job| job.name == name)
    }

    /// Structural validation: job names, steps and matrices.
    ///
    /// Dependency edges are checked when the job graph is built.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.jobs.is_empty() {
            return Err(ConfigError::EmptyPipeline(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if !seen.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
            job.validate()?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerRule {
    pub event: EventKind,
    /// Branch patterns; empty means any branch.
    #[serde(default)]
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowCall,
    WorkflowDispatch,
    Push,
    PullRequest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkflowCall => "workflow_call",
            EventKind::WorkflowDispatch => "workflow_dispatch",
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "workflow_call" => Ok(EventKind::WorkflowCall),
            "workflow_dispatch" | "dispatch" | "manual" => Ok(EventKind::WorkflowDispatch),
            "push" => Ok(EventKind::Push),
            "pull_request" | "pr" => Ok(EventKind::PullRequest),
            _ => Err(ConfigError::UnknownEventKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct JobTemplate {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    /// Runtime target selector. May reference a matrix axis.
    #[serde(default = "default_runs_on")]
    pub runs_on: String,
    #[serde(default)]
    pub matrix: Option<MatrixSpec>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub continue_on_error: ContinueOnError,
    #[serde(default)]
    pub cache: Option<CacheSpec>,
}

fn default_runs_on() -> String {
    "local".to_string()
}

impl JobTemplate {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_minutes
            .map(|minutes| Duration::from_secs(u64::from(minutes) * 60))
    }

    pub fn fail_fast(&self) -> bool {
        self.matrix.as_ref().is_none_or(|m| m.fail_fast)
    }

    pub fn max_parallel(&self) -> Option<usize> {
        self.matrix.as_ref().and_then(|m| m.max_parallel)
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (index, step) in self.steps.iter().enumerate() {
            step.action(&self.name, index)?;
        }
        if let Some(matrix) = &self.matrix {
            matrix.validate(&self.name)?;
        }
        Ok(())
    }
}

/// Either a literal flag or an expression evaluated per matrix binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ContinueOnError {
    Flag(bool),
    Expression(String),
}

impl Default for ContinueOnError {
    fn default() -> Self {
        ContinueOnError::Flag(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct MatrixSpec {
    #[serde(default)]
    #[schemars(with = "BTreeMap<String, Vec<serde_json::Value>>")]
    pub axes: MatrixAxes,
    #[serde(default)]
    pub include: Vec<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, serde_json::Value>>,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl MatrixSpec {
    fn validate(&self, job: &str) -> std::result::Result<(), ConfigError> {
        let malformed = |reason: String| ConfigError::MalformedMatrix {
            job: job.to_string(),
            reason,
        };

        if self.axes.is_empty() && self.include.is_empty() {
            return Err(malformed("no axes and no include entries".into()));
        }

        let mut names = HashSet::new();
        for axis in self.axes.iter() {
            if axis.name.trim().is_empty() {
                return Err(malformed("axis with an empty name".into()));
            }
            if !names.insert(axis.name.as_str()) {
                return Err(malformed(format!("duplicate axis '{}'", axis.name)));
            }
            if let Some(value) = axis.values.iter().find(|v| !is_scalar(v)) {
                return Err(malformed(format!(
                    "axis '{}' has a non-scalar value {}",
                    axis.name, value
                )));
            }
        }

        for entry in &self.exclude {
            if entry.is_empty() {
                return Err(malformed("empty exclude entry".into()));
            }
            if let Some(key) = entry.keys().find(|k| !names.contains(k.as_str())) {
                return Err(malformed(format!("exclude refers to unknown axis '{key}'")));
            }
        }

        for entry in &self.include {
            if entry.is_empty() {
                return Err(malformed("empty include entry".into()));
            }
            if let Some((key, _)) = entry.iter().find(|(_, v)| !is_scalar(v)) {
                return Err(malformed(format!("include key '{key}' has a non-scalar value")));
            }
        }

        if self.max_parallel == Some(0) {
            return Err(malformed("max-parallel must be at least 1".into()));
        }

        Ok(())
    }
}

fn is_scalar(value: &serde_json::Value) -> bool {
    !matches!(
        value,
        serde_json::Value::Array(_) | serde_json::Value::Object(_)
    )
}

/// Render a YAML scalar the way it appears in names and interpolations.
pub fn render_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Matrix axes in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixAxes(Vec<MatrixAxis>);

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<serde_json::Value>,
}

impl MatrixAxes {
    pub fn new(axes: Vec<MatrixAxis>) -> Self {
        Self(axes)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MatrixAxis> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|axis| axis.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|axis| axis.name == name)
    }
}

impl<S: Into<String>> FromIterator<(S, Vec<serde_json::Value>)> for MatrixAxes {
    fn from_iter<I: IntoIterator<Item = (S, Vec<serde_json::Value>)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, values)| MatrixAxis {
                    name: name.into(),
                    values,
                })
                .collect(),
        )
    }
}

impl Serialize for MatrixAxes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for axis in &self.0 {
            map.serialize_entry(&axis.name, &axis.values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MatrixAxes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AxesVisitor;

        impl<'de> Visitor<'de> for AxesVisitor {
            type Value = MatrixAxes;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of axis name to a list of values")
            }

            // Duplicates are kept so validation can report them.
            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut axes = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, values)) =
                    access.next_entry::<String, Vec<serde_json::Value>>()?
                {
                    axes.push(MatrixAxis { name, values });
                }
                Ok(MatrixAxes(axes))
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
                Ok(MatrixAxes::default())
            }
        }

        deserializer.deserialize_map(AxesVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct StepDefinition {
    #[serde(default)]
    pub name: Option<String>,
    /// Capability reference, e.g. `checkout` or `cache@1`.
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(default)]
    pub with: HashMap<String, String>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub shell: Option<Shell>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<String>,
}

impl StepDefinition {
    pub fn command(script: impl Into<String>) -> Self {
        Self {
            name: None,
            uses: None,
            with: HashMap::new(),
            run: Some(script.into()),
            shell: None,
            env: HashMap::new(),
            working_directory: None,
        }
    }

    pub fn capability(reference: impl Into<String>) -> Self {
        Self {
            uses: Some(reference.into()),
            run: None,
            ..Self::command("")
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Human-readable label used in logs and reports.
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(uses) = &self.uses {
            return uses.clone();
        }
        let first_line = self
            .run
            .as_deref()
            .and_then(|script| script.lines().find(|l| !l.trim().is_empty()))
            .unwrap_or("")
            .trim();
        if first_line.chars().count() > 48 {
            let truncated: String = first_line.chars().take(45).collect();
            format!("{truncated}...")
        } else {
            first_line.to_string()
        }
    }

    /// Resolve what this step does. Exactly one of `uses` and `run` must be set.
    pub fn action(&self, job: &str, index: usize) -> std::result::Result<StepAction, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidStep {
            job: job.to_string(),
            index,
            reason: reason.to_string(),
        };

        match (&self.uses, &self.run) {
            (Some(_), Some(_)) => Err(invalid("both 'uses' and 'run' are set")),
            (None, None) => Err(invalid("one of 'uses' or 'run' is required")),
            (Some(reference), None) if reference.trim().is_empty() => {
                Err(invalid("'uses' is empty"))
            }
            (None, Some(script)) if script.trim().is_empty() => Err(invalid("'run' is empty")),
            (Some(reference), None) => Ok(StepAction::Capability {
                reference: reference.trim().to_string(),
                inputs: self.with.clone(),
            }),
            (None, Some(script)) => Ok(StepAction::Command {
                script: script.clone(),
                shell: self.shell,
            }),
        }
    }
}

/// The resolved form of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    Command {
        script: String,
        shell: Option<Shell>,
    },
    Capability {
        reference: String,
        inputs: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    Bash,
    Sh,
    Pwsh,
    Powershell,
    Cmd,
    Python,
}

impl Shell {
    /// `bash` on Unix-likes, `pwsh` on Windows.
    pub fn platform_default() -> Self {
        if cfg!(windows) { Shell::Pwsh } else { Shell::Bash }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Shell::Bash => "bash",
            Shell::Sh => "sh",
            Shell::Pwsh => "pwsh",
            Shell::Powershell => "powershell",
            Shell::Cmd => "cmd",
            Shell::Python => "python",
        }
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Shell {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bash" => Ok(Shell::Bash),
            "sh" => Ok(Shell::Sh),
            "pwsh" => Ok(Shell::Pwsh),
            "powershell" => Ok(Shell::Powershell),
            "cmd" => Ok(Shell::Cmd),
            "python" => Ok(Shell::Python),
            _ => Err(ConfigError::UnknownShell(s.to_string())),
        }
    }
}

/// Job-level cache declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct CacheSpec {
    /// Workspace-relative paths to archive.
    pub paths: Vec<String>,
    /// Toolchain identity folded into the key, e.g. `stable` or `1.85.0`.
    #[serde(default)]
    pub toolchain: Option<String>,
    /// Workspace-relative files whose contents are hashed into the key.
    #[serde(default)]
    pub lock_files: Vec<String>,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
name: ci
jobs:
  - name: build
    steps:
      - run: echo hi
"#;

    #[test]
    fn test_minimal_definition_defaults() {
        let def = PipelineDefinition::from_yaml(MINIMAL).unwrap();
        let job = &def.jobs[0];
        assert_eq!(job.runs_on, "local");
        assert!(job.needs.is_empty());
        assert!(job.fail_fast());
        assert_eq!(job.continue_on_error, ContinueOnError::Flag(false));
        assert!(def.triggers.is_empty());
    }

    #[test]
    fn test_matrix_axes_keep_declared_order() {
        let yaml = r#"
name: ci
jobs:
  - name: test
    matrix:
      axes:
        zeta: [1, 2]
        alpha: [a]
        mid: [true]
    steps:
      - run: "true"
"#;
        let def = PipelineDefinition::from_yaml(yaml).unwrap();
        let matrix = def.jobs[0].matrix.as_ref().unwrap();
        let names: Vec<_> = matrix.axes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(render_scalar(&matrix.axes.iter().next().unwrap().values[1]), "2");
    }

    #[test]
    fn test_duplicate_axis_is_malformed() {
        let yaml = r#"
name: ci
jobs:
  - name: test
    matrix:
      axes:
        os: [a]
        os: [b]
    steps:
      - run: "true"
"#;
        let def: PipelineDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            def.validate(),
            Err(ConfigError::MalformedMatrix { .. })
        ));
    }

    #[test]
    fn test_exclude_unknown_axis_is_malformed() {
        let yaml = r#"
name: ci
jobs:
  - name: test
    matrix:
      axes:
        os: [a, b]
      exclude:
        - arch: x86
    steps:
      - run: "true"
"#;
        let err = PipelineDefinition::from_yaml(yaml).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_step_requires_exactly_one_action() {
        let mut step = StepDefinition::command("make");
        step.uses = Some("checkout".into());
        assert!(matches!(
            step.action("build", 0),
            Err(ConfigError::InvalidStep { index: 0, .. })
        ));

        step.uses = None;
        step.run = None;
        assert!(step.action("build", 2).is_err());

        let ok = StepDefinition::capability("cache@1");
        assert_eq!(
            ok.action("build", 1).unwrap(),
            StepAction::Capability {
                reference: "cache@1".into(),
                inputs: HashMap::new()
            }
        );
    }

    #[test]
    fn test_duplicate_job_rejected() {
        let yaml = r#"
name: ci
jobs:
  - name: build
    steps: [{ run: a }]
  - name: build
    steps: [{ run: b }]
"#;
        let def: PipelineDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            def.validate(),
            Err(ConfigError::DuplicateJob("build".into()))
        );
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let def: PipelineDefinition = serde_yaml::from_str("name: ci\njobs: []\n").unwrap();
        assert_eq!(def.validate(), Err(ConfigError::EmptyPipeline("ci".into())));
    }

    #[test]
    fn test_event_kind_and_shell_parse() {
        assert_eq!("pull-request".parse::<EventKind>().unwrap(), EventKind::PullRequest);
        assert_eq!("workflow_call".parse::<EventKind>().unwrap(), EventKind::WorkflowCall);
        assert!("tag".parse::<EventKind>().is_err());
        assert_eq!("PWSH".parse::<Shell>().unwrap(), Shell::Pwsh);
        assert!("zsh".parse::<Shell>().is_err());
    }

    #[test]
    fn test_step_label_fallbacks() {
        assert_eq!(StepDefinition::command("cargo test --all\n").label(), "cargo test --all");
        assert_eq!(StepDefinition::capability("checkout").label(), "checkout");
        assert_eq!(StepDefinition::command("x").named("Build").label(), "Build");
    }
}
