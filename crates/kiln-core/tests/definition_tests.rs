//! Loading realistic pipeline definitions end to end.

use kiln_core::ConfigError;
use kiln_core::pipeline::*;
use pretty_assertions::assert_eq;

const CI: &str = r#"
name: ci
description: Checks for every pull request
on:
  - event: pull_request
    branches: [main, "release/**"]
  - event: workflow_call
env:
  CARGO_TERM_COLOR: always
jobs:
  - name: fmt
    runs-on: ubuntu-latest
    steps:
      - uses: checkout
      - name: Check formatting
        run: cargo fmt --all -- --check

  - name: test
    runs-on: ${{ matrix.os }}
    needs: [fmt]
    timeout-minutes: 30
    continue-on-error: ${{ matrix.experimental }}
    matrix:
      axes:
        os: [ubuntu-latest, macos-latest, windows-latest]
        rust: [stable]
      include:
        - os: ubuntu-latest
          rust: nightly
          experimental: true
      exclude:
        - os: macos-latest
      max-parallel: 2
    cache:
      paths: [target]
      toolchain: ${{ matrix.rust }}
      lock-files: [Cargo.lock]
    env:
      RUST_BACKTRACE: "1"
    steps:
      - uses: checkout
      - run: cargo test --all-features
        shell: bash

  - name: public-api
    needs: [test]
    continue-on-error: true
    steps:
      - run: cargo public-api diff
        working-directory: crates/core
"#;

#[test]
fn test_loads_full_definition() {
    let def = PipelineDefinition::from_yaml(CI).unwrap();

    assert_eq!(def.name, "ci");
    assert_eq!(def.triggers.len(), 2);
    assert_eq!(def.triggers[0].event, EventKind::PullRequest);
    assert_eq!(def.triggers[0].branches, vec!["main", "release/**"]);
    assert!(def.triggers[1].branches.is_empty());
    assert_eq!(def.env["CARGO_TERM_COLOR"], "always");

    let names: Vec<_> = def.jobs.iter().map(|j| j.name.as_str()).collect();
    assert_eq!(names, vec!["fmt", "test", "public-api"]);

    let test = def.job("test").unwrap();
    assert_eq!(test.needs, vec!["fmt"]);
    assert_eq!(test.runs_on, "${{ matrix.os }}");
    assert_eq!(test.timeout_minutes, Some(30));
    assert_eq!(
        test.continue_on_error,
        ContinueOnError::Expression("${{ matrix.experimental }}".into())
    );
    assert_eq!(test.max_parallel(), Some(2));
    assert!(test.fail_fast());

    let cache = test.cache.as_ref().unwrap();
    assert_eq!(cache.paths, vec!["target"]);
    assert_eq!(cache.lock_files, vec!["Cargo.lock"]);

    let step = &test.steps[1];
    assert_eq!(step.shell, Some(Shell::Bash));
    assert_eq!(
        step.action("test", 1).unwrap(),
        StepAction::Command {
            script: "cargo test --all-features".into(),
            shell: Some(Shell::Bash),
        }
    );

    let api = def.job("public-api").unwrap();
    assert_eq!(api.continue_on_error, ContinueOnError::Flag(true));
    assert_eq!(api.steps[0].working_directory.as_deref(), Some("crates/core"));
    assert_eq!(def.job_index("public-api"), Some(2));
}

#[test]
fn test_yaml_round_trip_preserves_axis_order() {
    let def = PipelineDefinition::from_yaml(CI).unwrap();
    let yaml = def.to_yaml().unwrap();
    let reparsed = PipelineDefinition::from_yaml(&yaml).unwrap();

    let axes = |d: &PipelineDefinition| -> Vec<String> {
        d.job("test")
            .and_then(|j| j.matrix.as_ref())
            .map(|m| m.axes.iter().map(|a| a.name.clone()).collect())
            .unwrap_or_default()
    };
    assert_eq!(axes(&def), vec!["os", "rust"]);
    assert_eq!(axes(&reparsed), axes(&def));
}

#[test]
fn test_invalid_step_is_configuration_error() {
    let yaml = r#"
name: broken
jobs:
  - name: build
    steps:
      - uses: checkout
        run: make
"#;
    let err = PipelineDefinition::from_yaml(yaml).unwrap_err();
    match err {
        kiln_core::Error::Configuration(ConfigError::InvalidStep { job, index, .. }) => {
            assert_eq!(job, "build");
            assert_eq!(index, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_unknown_event_kind_fails_to_parse() {
    let yaml = r#"
name: ci
on:
  - event: tag
jobs:
  - name: build
    steps: [{ run: make }]
"#;
    assert!(PipelineDefinition::from_yaml(yaml).is_err());
}

#[test]
fn test_json_schema_describes_jobs() {
    let schema = PipelineDefinition::json_schema();
    let properties = &schema["properties"];
    assert!(properties.get("jobs").is_some());
    assert!(properties.get("on").is_some());
    assert!(schema["definitions"].get("JobTemplate").is_some());
}
