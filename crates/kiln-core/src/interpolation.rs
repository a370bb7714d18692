use crate::event::TriggerEvent;
use crate::instance::MatrixBinding;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("expression pattern is valid")
});

/// Context for `${{ ... }}` interpolation.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Pipeline and job env
    pub variables: HashMap<String, String>,
    /// Matrix values for the current instance
    pub matrix: HashMap<String, String>,
    /// `event.kind`, `event.branch`, `event.sha`
    pub event: HashMap<String, String>,
}

impl InterpolationContext {
    /// Create a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_matrix(mut self, binding: &MatrixBinding) -> Self {
        self.matrix = binding.to_map();
        self
    }

    pub fn with_event(mut self, event: &TriggerEvent) -> Self {
        self.event
            .insert("kind".to_string(), event.kind.as_str().to_string());
        if let Some(branch) = event.branch() {
            self.event.insert("branch".to_string(), branch.to_string());
        }
        if let Some(sha) = &event.sha {
            self.event.insert("sha".to_string(), sha.clone());
        }
        self
    }

    /// Interpolate expressions in a string.
    ///
    /// Supports:
    /// - `${{ variable }}` - direct variable lookup
    /// - `${{ env.VAR }}` - pipeline/job env
    /// - `${{ matrix.key }}` - matrix value
    /// - `${{ event.kind }}`, `${{ event.branch }}`, `${{ event.sha }}`
    ///
    /// Unknown references resolve to the empty string.
    pub fn interpolate(&self, input: &str) -> String {
        if !input.contains("${{") {
            return input.to_string();
        }

        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .to_string()
    }

    /// Resolve a single expression.
    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self
                .variables
                .get(var_name)
                .cloned()
                .unwrap_or_default();
        }

        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned().unwrap_or_default();
        }

        if let Some(key) = expr.strip_prefix("event.") {
            return self.event.get(key).cloned().unwrap_or_default();
        }

        self.variables.get(expr).cloned().unwrap_or_default()
    }

    /// Evaluate a flag expression such as `${{ matrix.experimental }}` or
    /// `${{ matrix.os }} == windows-latest`.
    pub fn evaluate_bool(&self, expr: &str) -> bool {
        let interpolated = self.interpolate(expr);
        let trimmed = interpolated.trim();

        if trimmed.eq_ignore_ascii_case("true") {
            return true;
        }
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("false") {
            return false;
        }

        if let Some((left, right)) = trimmed.split_once("!=") {
            return unquote(left) != unquote(right);
        }
        if let Some((left, right)) = trimmed.split_once("==") {
            return unquote(left) == unquote(right);
        }

        false
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .unwrap_or(s)
}
