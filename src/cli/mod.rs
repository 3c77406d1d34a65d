//! Command-line interface for scribe_forge.
//!
//! Provides commands for running the pipeline, ingesting recordings and
//! managing artifacts.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
