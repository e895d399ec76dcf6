//! Error types for E2E testing

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Server binary not found at {}. Build it first or set ARBOR_SUT_BIN", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("Server not ready after {attempts} health checks in {elapsed:?}")]
    ServerHealthCheck { attempts: usize, elapsed: Duration },

    #[error("Server exited before becoming ready: {0}")]
    ServerExited(String),

    /// Shared setup failed earlier; later callers see the original reason.
    #[error("Harness setup failed: {0}")]
    SetupFailed(String),

    #[error("{method} {path}: expected status {expected}, got {actual}; body: {body}")]
    UnexpectedStatus {
        method: String,
        path: String,
        expected: u16,
        actual: u16,
        body: String,
    },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("SQL error in `{query}` with args {args}: {source}")]
    Sql {
        query: String,
        args: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Not a failure: the case chose not to run.
    #[error("Skipped: {0}")]
    Skipped(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Common(#[from] arbor_common::Error),
}

impl E2eError {
    pub fn is_skip(&self) -> bool {
        matches!(self, E2eError::Skipped(_))
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        E2eError::Skipped(reason.into())
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        E2eError::AssertionFailed(message.into())
    }
}

pub type E2eResult<T> = Result<T, E2eError>;

/// Return an assertion failure from the enclosing function unless `cond` holds.
#[macro_export]
macro_rules! ensure_that {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::E2eError::AssertionFailed(format!($($arg)+)));
        }
    };
}
