//! Kiln Core
//!
//! Core domain types, traits, and error handling for the kiln pipeline
//! engine. This crate has minimal dependencies and defines the shared
//! vocabulary used across all other crates.

pub mod env;
pub mod error;
pub mod event;
pub mod ids;
pub mod instance;
pub mod interpolation;
pub mod pipeline;
pub mod ports;
pub mod run;

pub use error::{ConfigError, Error, Result};
pub use ids::*;
