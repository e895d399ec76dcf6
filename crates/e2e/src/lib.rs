//! Arbor E2E Fixture Runtime
//!
//! Shared fixtures for end-to-end tests of an Arbor server binary:
//! - Spawns the server as a subprocess on a free port with its own data dir
//! - Drives it over HTTPS with a blocking JSON client
//! - Inspects its SQLite databases directly through persistent connections
//! - Records every test outcome in an append-only results database
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Lifecycle (once per process)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ensure() -> Fixture                                        │
//! │    ├── Harness     child process, data dir, HTTP client     │
//! │    ├── Inspector   nodes.db / flows.db connections          │
//! │    └── Results     test_results.db                          │
//! │  teardown(): Inspector -> Harness -> Results                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestRunner                                                 │
//! │    ├── select cases by name / dotted group                  │
//! │    ├── run on N workers, panics caught                      │
//! │    └── CaseRecorder per case -> test_results row            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything here blocks. Call it from plain threads, not from inside an
//! async runtime.

pub mod client;
pub mod error;
pub mod harness;
pub mod inspector;
pub mod json;
pub mod lifecycle;
pub mod options;
pub mod results;
pub mod runner;

pub use client::{require_status, ApiResponse, Session};
pub use error::{E2eError, E2eResult};
pub use harness::{DbPaths, Harness, HarnessState};
pub use inspector::{FlowStep, Inspector, Stratum};
pub use json::{contains_id, JsonExt};
pub use lifecycle::{Fixture, Lifecycle};
pub use options::HarnessOptions;
pub use results::{CaseRecorder, ResultSummary, ResultsStore};
pub use runner::{RunnerConfig, TestCase, TestRunner, TestSuiteResult};
