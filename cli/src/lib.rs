//! Profile Memory CLI
//!
//! Command-line front end for the `profile-memory` store: opens a
//! RocksDB-backed orchestrator and maps subcommands onto its operations.

pub mod commands;
pub mod memory;

pub use commands::Command;
pub use memory::{open, ProviderKind, StoreOptions};
