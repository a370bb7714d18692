//! Matrix expansion for parallel job generation.

use kiln_core::env::EnvLayers;
use kiln_core::event::TriggerEvent;
use kiln_core::ids::InstanceId;
use kiln_core::instance::{JobInstance, MatrixBinding};
use kiln_core::interpolation::InterpolationContext;
use kiln_core::pipeline::{
    CacheSpec, ContinueOnError, JobTemplate, MatrixSpec, StepDefinition, render_scalar,
};
use std::collections::HashMap;
use tracing::debug;

/// Run-wide inputs to one template expansion.
#[derive(Debug, Clone, Copy)]
pub struct ExpansionContext<'a> {
    /// Pipeline-level env, the lowest layer of every instance's env.
    pub pipeline_env: &'a HashMap<String, String>,
    pub event: &'a TriggerEvent,
    /// Declaration index of the template.
    pub job_index: usize,
    pub stage: usize,
}

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a job template into its instances.
    ///
    /// A template without a matrix yields exactly one instance.
    pub fn expand(&self, template: &JobTemplate, context: &ExpansionContext<'_>) -> Vec<JobInstance> {
        let bindings = match &template.matrix {
            Some(matrix) => self.combinations(matrix),
            None => vec![MatrixBinding::new()],
        };

        debug!(job = %template.name, instances = bindings.len(), "Expanded matrix");

        bindings
            .into_iter()
            .enumerate()
            .map(|(index, binding)| self.instantiate(template, context, index, binding))
            .collect()
    }

    /// Bindings of a matrix in declared order: the cross product with the
    /// first axis varying slowest, minus excludes, plus new includes.
    pub fn combinations(&self, matrix: &MatrixSpec) -> Vec<MatrixBinding> {
        if matrix.axes.iter().any(|axis| axis.values.is_empty()) {
            return Vec::new();
        }

        let mut combinations = if matrix.axes.is_empty() {
            Vec::new()
        } else {
            let mut result = vec![MatrixBinding::new()];
            for axis in matrix.axes.iter() {
                let mut next = Vec::with_capacity(result.len() * axis.values.len());
                for combo in &result {
                    for value in &axis.values {
                        next.push(combo.clone().with(axis.name.clone(), render_scalar(value)));
                    }
                }
                result = next;
            }
            result
        };

        combinations.retain(|combo| !matrix.exclude.iter().any(|entry| combo.contains_all(entry)));

        for entry in &matrix.include {
            // Axis keys first in declared order, extra keys after.
            let mut binding = MatrixBinding::new();
            for axis in matrix.axes.iter() {
                if let Some(value) = entry.get(&axis.name) {
                    binding.push(axis.name.clone(), render_scalar(value));
                }
            }
            for (key, value) in entry {
                if !matrix.axes.contains(key) {
                    binding.push(key.clone(), render_scalar(value));
                }
            }

            if !combinations.contains(&binding) {
                combinations.push(binding);
            }
        }

        combinations
    }

    fn instantiate(
        &self,
        template: &JobTemplate,
        context: &ExpansionContext<'_>,
        index: usize,
        binding: MatrixBinding,
    ) -> JobInstance {
        let base = InterpolationContext::new()
            .with_variables(context.pipeline_env.clone())
            .with_matrix(&binding)
            .with_event(context.event);
        let pipeline_env = interpolate_map(&base, context.pipeline_env);
        // Job env may refer to pipeline env.
        let job_env = interpolate_map(
            &base.clone().with_variables(pipeline_env.clone()),
            &template.env,
        );

        let mut variables = pipeline_env.clone();
        variables.extend(job_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let interp = base.with_variables(variables);

        let env = EnvLayers::new()
            .with_layer(&pipeline_env)
            .with_layer(&job_env);

        let steps = template
            .steps
            .iter()
            .map(|step| StepDefinition {
                name: step.name.as_deref().map(|n| interp.interpolate(n)),
                uses: step.uses.as_deref().map(|u| interp.interpolate(u)),
                with: interpolate_map(&interp, &step.with),
                run: step.run.as_deref().map(|r| interp.interpolate(r)),
                shell: step.shell,
                env: interpolate_map(&interp, &step.env),
                working_directory: step
                    .working_directory
                    .as_deref()
                    .map(|d| interp.interpolate(d)),
            })
            .collect();

        let continue_on_error = match &template.continue_on_error {
            ContinueOnError::Flag(flag) => *flag,
            ContinueOnError::Expression(expr) => interp.evaluate_bool(expr),
        };

        let cache = template.cache.as_ref().map(|cache| CacheSpec {
            paths: cache.paths.iter().map(|p| interp.interpolate(p)).collect(),
            toolchain: cache.toolchain.as_deref().map(|t| interp.interpolate(t)),
            lock_files: cache.lock_files.iter().map(|p| interp.interpolate(p)).collect(),
            prefix: cache.prefix.as_deref().map(|p| interp.interpolate(p)),
        });

        JobInstance {
            id: InstanceId::new(context.job_index, index),
            job: template.name.clone(),
            display_name: binding.display_name(template.label()),
            stage: context.stage,
            runs_on: interp.interpolate(&template.runs_on),
            binding,
            steps,
            env,
            timeout: template.timeout(),
            continue_on_error,
            cache,
        }
    }
}

fn interpolate_map(interp: &InterpolationContext, vars: &HashMap<String, String>) -> HashMap<String, String> {
    vars.iter()
        .map(|(k, v)| (k.clone(), interp.interpolate(v)))
        .collect()
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}
