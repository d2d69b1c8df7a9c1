//! Command-line interface for infra-orchestrator.
//!
//! Provides commands for schema migration, infrastructure init and cleanup,
//! step dispatch, abort and callback delivery.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
