//! Structured logging for kiln.
//!
//! Installs the `tracing` subscriber (human or JSON output, filtered by
//! `RUST_LOG` or the configured level) and provides spans carrying CI
//! attributes for runs, stages, instances, steps and cache operations.

pub mod spans;
pub mod tracer;

pub use spans::{CiAttributes, cache_span, instance_span, run_span, stage_span, step_span};
pub use tracer::{LogFormat, TracerError, TracingConfig, init_tracing};
