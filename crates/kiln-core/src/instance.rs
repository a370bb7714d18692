//! Job instances: one concrete execution unit per matrix combination.

use crate::env::EnvLayers;
use crate::ids::InstanceId;
use crate::pipeline::{CacheSpec, StepDefinition, render_scalar};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

/// Ordered `(axis, value)` pairs for one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MatrixBinding(Vec<(String, String)>);

impl MatrixBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, axis: impl Into<String>, value: impl Into<String>) {
        self.0.push((axis.into(), value.into()));
    }

    pub fn with(mut self, axis: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(axis, value);
        self
    }

    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every pair of `partial` appears in this binding.
    pub fn contains_all(&self, partial: &BTreeMap<String, serde_json::Value>) -> bool {
        partial
            .iter()
            .all(|(axis, value)| self.get(axis) == Some(render_scalar(value).as_str()))
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.0.iter().cloned().collect()
    }

    /// `"job (v1, v2)"`, or just `"job"` for an empty binding.
    pub fn display_name(&self, job: &str) -> String {
        if self.0.is_empty() {
            return job.to_string();
        }
        let values: Vec<&str> = self.0.iter().map(|(_, v)| v.as_str()).collect();
        format!("{} ({})", job, values.join(", "))
    }
}

impl fmt::Display for MatrixBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", pairs.join(", "))
    }
}

impl Serialize for MatrixBinding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (axis, value) in &self.0 {
            map.serialize_entry(axis, value)?;
        }
        map.end()
    }
}

/// A template bound to one matrix combination, with every expression
/// already resolved.
#[derive(Debug, Clone, Serialize)]
pub struct JobInstance {
    pub id: InstanceId,
    pub job: String,
    pub display_name: String,
    pub stage: usize,
    pub binding: MatrixBinding,
    pub runs_on: String,
    pub steps: Vec<StepDefinition>,
    /// Pipeline and job layers; step env is layered on by the runner.
    #[serde(skip)]
    pub env: EnvLayers,
    pub timeout: Option<Duration>,
    pub continue_on_error: bool,
    pub cache: Option<CacheSpec>,
}

impl JobInstance {
    pub fn index(&self) -> usize {
        self.id.index
    }
}
