//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::path::PathBuf;

use tempfile::TempDir;

use arbor_e2e::HarnessOptions;

/// The reference server built with this package.
pub fn stub_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_arbor-stub"))
}

/// Options for a quiet SUT whose results log lives in `scratch`.
pub fn options(scratch: &TempDir) -> HarnessOptions {
    HarnessOptions {
        forward_output: false,
        ..HarnessOptions::default()
            .with_binary(stub_binary())
            .with_results_path(scratch.path().join("test_results.db"))
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
