//! Arbor Common Library
//!
//! Domain types, the server config file model and the SQLite schemas shared
//! by the Arbor reference server and the E2E fixture runtime.

pub mod config;
pub mod db;
pub mod error;
pub mod types;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use types::*;

/// File names the server expects inside its data directory.
pub const CONFIG_FILE: &str = "config.toml";
pub const NODES_DB_FILE: &str = "nodes.db";
pub const FLOWS_DB_FILE: &str = "flows.db";
pub const METRICS_DB_FILE: &str = "metrics.db";

/// Results database name, written to the harness's working directory.
pub const RESULTS_DB_FILE: &str = "test_results.db";
