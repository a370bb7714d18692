//! Trigger matching and evaluation.

use kiln_core::event::{RunDecision, TriggerEvent};
use kiln_core::pipeline::{EventKind, PipelineDefinition, TriggerRule};
use tracing::debug;

/// Decides whether an event starts a run of a pipeline.
pub struct TriggerEvaluator;

impl TriggerEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Match `event` against the definition's rules in declaration order.
    ///
    /// The first matching rule produces the decision. A definition without
    /// any rules runs on pushes to any branch and on manual dispatch.
    pub fn decide(&self, definition: &PipelineDefinition, event: &TriggerEvent) -> Option<RunDecision> {
        if definition.triggers.is_empty() {
            return matches!(event.kind, EventKind::Push | EventKind::WorkflowDispatch).then(|| {
                RunDecision {
                    rule_index: 0,
                    matched: event.kind,
                    reusable: false,
                }
            });
        }

        let decision = definition
            .triggers
            .iter()
            .enumerate()
            .find(|(_, rule)| self.rule_matches(rule, event))
            .map(|(rule_index, rule)| RunDecision {
                rule_index,
                matched: rule.event,
                reusable: rule.event == EventKind::WorkflowCall,
            });

        debug!(
            pipeline = %definition.name,
            event = %event.kind,
            branch = event.branch().unwrap_or(""),
            matched = ?decision.as_ref().map(|d| d.rule_index),
            "Evaluated triggers"
        );
        decision
    }

    fn rule_matches(&self, rule: &TriggerRule, event: &TriggerEvent) -> bool {
        match rule.event {
            // Reusable calls are accepted regardless of branch.
            EventKind::WorkflowCall => {
                event.kind == EventKind::WorkflowCall || event.is_reusable_call
            }
            kind => kind == event.kind && self.branch_matches(&rule.branches, event.branch()),
        }
    }

    fn branch_matches(&self, patterns: &[String], branch: Option<&str>) -> bool {
        if patterns.is_empty() {
            return true; // Match all branches if no patterns specified
        }
        match branch {
            Some(branch) => patterns.iter().any(|p| glob_match(p, branch)),
            None => false,
        }
    }
}

impl Default for TriggerEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Branch glob: `*` and `?` stay within one path segment, `**` crosses
/// segments.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn matches(pattern: &[u8], text: &[u8]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some((b'*', rest)) => {
                if let Some(rest) = rest.strip_prefix(b"*") {
                    (0..=text.len()).any(|i| matches(rest, &text[i..]))
                } else {
                    let segment_end = text.iter().position(|&c| c == b'/').unwrap_or(text.len());
                    (0..=segment_end).any(|i| matches(rest, &text[i..]))
                }
            }
            Some((b'?', rest)) => {
                text.first().is_some_and(|&c| c != b'/') && matches(rest, &text[1..])
            }
            Some((c, rest)) => text.first() == Some(c) && matches(rest, &text[1..]),
        }
    }

    matches(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn definition(yaml_on: &str) -> PipelineDefinition {
        PipelineDefinition::from_yaml(&format!(
            "name: ci\non:\n{yaml_on}\njobs:\n  - name: build\n    steps:\n      - run: make\n"
        ))
        .unwrap()
    }

    #[test]
    fn test_branch_match_exact() {
        let evaluator = TriggerEvaluator::new();
        assert!(evaluator.branch_matches(&["main".to_string()], Some("main")));
        assert!(!evaluator.branch_matches(&["main".to_string()], Some("develop")));
        assert!(!evaluator.branch_matches(&["main".to_string()], None));
    }

    #[test]
    fn test_branch_match_glob() {
        assert!(glob_match("feature/*", "feature/foo"));
        assert!(!glob_match("feature/*", "feature/foo/bar"));
        assert!(glob_match("release/**", "release/v1/hotfix"));
        assert!(glob_match("**", "any/thing"));
        assert!(glob_match("v?.x", "v1.x"));
        assert!(glob_match("*-stable", "1.80-stable"));
        assert!(!glob_match("release/**", "releases/v1"));
    }

    #[test]
    fn test_empty_patterns_match_all() {
        let evaluator = TriggerEvaluator::new();
        assert!(evaluator.branch_matches(&[], Some("any-branch")));
        assert!(evaluator.branch_matches(&[], None));
    }

    #[test]
    fn test_pull_request_branch_filter() {
        let def = definition("  - event: pull_request\n    branches: [main]");
        let evaluator = TriggerEvaluator::new();

        let decision = evaluator
            .decide(&def, &TriggerEvent::pull_request("refs/heads/main"))
            .unwrap();
        assert_eq!(decision.matched, EventKind::PullRequest);
        assert!(!decision.reusable);

        assert!(evaluator
            .decide(&def, &TriggerEvent::pull_request("develop"))
            .is_none());
        assert!(evaluator.decide(&def, &TriggerEvent::push("main")).is_none());
    }

    #[test]
    fn test_workflow_call_ignores_branches() {
        let def = definition(
            "  - event: pull_request\n    branches: [main]\n  - event: workflow_call",
        );
        let evaluator = TriggerEvaluator::new();

        let decision = evaluator
            .decide(&def, &TriggerEvent::new(EventKind::WorkflowCall))
            .unwrap();
        assert_eq!(decision.rule_index, 1);
        assert!(decision.reusable);

        let reusable_push = TriggerEvent::push("some-topic").reusable();
        let decision = evaluator.decide(&def, &reusable_push).unwrap();
        assert_eq!(decision.matched, EventKind::WorkflowCall);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let def = definition(
            "  - event: push\n    branches: ['release/**']\n  - event: push",
        );
        let decision = TriggerEvaluator::new()
            .decide(&def, &TriggerEvent::push("release/1.0"))
            .unwrap();
        assert_eq!(decision.rule_index, 0);

        let decision = TriggerEvaluator::new()
            .decide(&def, &TriggerEvent::push("main"))
            .unwrap();
        assert_eq!(decision.rule_index, 1);
    }

    #[test]
    fn test_no_rules_defaults_to_push_and_dispatch() {
        let def = PipelineDefinition::from_yaml("name: ci\njobs:\n  - name: a\n    steps:\n      - run: 'true'\n").unwrap();
        let evaluator = TriggerEvaluator::new();
        assert!(evaluator.decide(&def, &TriggerEvent::push("main")).is_some());
        assert!(evaluator
            .decide(&def, &TriggerEvent::new(EventKind::WorkflowDispatch))
            .is_some());
        assert!(evaluator
            .decide(&def, &TriggerEvent::pull_request("main"))
            .is_none());
    }
}
