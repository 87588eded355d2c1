//! feature-pilot library crate
//!
//! Turns free-text feedback into pull requests: an analyzer lets a model
//! explore the repository and propose changes, and an applier opens one
//! branch, commit and pull request per change. Exposed as a library so the
//! binary, benchmarks and embedding services share the same pipeline.

pub mod analyzer;
pub mod apply;
pub mod config;
pub mod gateway;
pub mod github;
pub mod jobs;
pub mod llm;
pub mod logging;
pub mod proposal;
pub mod service;
pub mod util;
