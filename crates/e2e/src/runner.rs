//! Suite runner: selects cases, runs them against the shared fixture with
//! bounded concurrency, records every outcome and summarizes the run

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use arbor_common::ResultStatus;

use crate::error::{E2eError, E2eResult};
use crate::lifecycle::{Fixture, Lifecycle};
use crate::results::{panic_message, CaseRecorder};

/// Body of a test case
pub type CaseFn = fn(&Fixture) -> E2eResult<()>;

/// A named test case. Names are dotted paths, `Group.case`.
#[derive(Clone, Copy)]
pub struct TestCase {
    pub name: &'static str,
    pub run: CaseFn,
}

impl TestCase {
    pub const fn new(name: &'static str, run: CaseFn) -> Self {
        Self { name, run }
    }

    /// True when the case is `group` itself or sits below it.
    pub fn in_group(&self, group: &str) -> bool {
        self.name == group
            || (self.name.starts_with(group) && self.name[group.len()..].starts_with('.'))
    }
}

/// Result of running a single test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub status: ResultStatus,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Result of running all tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
}

impl TestSuiteResult {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Configuration for the test runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Run only cases whose name contains this
    pub filter: Option<String>,

    /// Run only cases in this dotted group
    pub group: Option<String>,

    /// Worker threads
    pub concurrency: usize,

    /// Where to write `test-results.json` (None = don't)
    pub output_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            filter: None,
            group: None,
            concurrency: 4,
            output_dir: None,
        }
    }
}

pub struct TestRunner {
    config: RunnerConfig,
    cases: Vec<TestCase>,
}

impl TestRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            cases: Vec::new(),
        }
    }

    pub fn add(&mut self, case: TestCase) -> &mut Self {
        self.cases.push(case);
        self
    }

    pub fn add_all(&mut self, cases: &[TestCase]) -> &mut Self {
        self.cases.extend_from_slice(cases);
        self
    }

    /// Cases that pass the configured filters, in registration order.
    pub fn selected(&self) -> Vec<TestCase> {
        self.cases
            .iter()
            .filter(|c| {
                self.config
                    .filter
                    .as_deref()
                    .map_or(true, |f| c.name.contains(f))
            })
            .filter(|c| self.config.group.as_deref().map_or(true, |g| c.in_group(g)))
            .copied()
            .collect()
    }

    /// Run the selected cases, then tear the lifecycle down.
    ///
    /// A setup failure is returned after teardown; no case runs.
    pub fn run(&self, lifecycle: &Lifecycle) -> E2eResult<TestSuiteResult> {
        let result = self.run_cases(lifecycle);
        lifecycle.teardown();
        result
    }

    fn run_cases(&self, lifecycle: &Lifecycle) -> E2eResult<TestSuiteResult> {
        let cases = self.selected();
        let start = Instant::now();

        let fixture = match lifecycle.ensure() {
            Ok(fixture) => fixture,
            Err(e) => {
                error!("Setup failed, no tests will run: {}", e);
                let mut setup = CaseRecorder::start(Arc::clone(lifecycle.results()), "Suite.setup");
                setup.fail(e.to_string());
                return Err(e);
            }
        };

        let workers = self.config.concurrency.clamp(1, cases.len().max(1));
        info!("Running {} test(s) on {} worker(s)...", cases.len(), workers);

        let next = AtomicUsize::new(0);
        let finished: Mutex<Vec<(usize, TestResult)>> = Mutex::new(Vec::with_capacity(cases.len()));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(case) = cases.get(index) else { break };
                    let result = run_case(fixture, case);
                    finished.lock().push((index, result));
                });
            }
        });

        let mut finished = finished.into_inner();
        finished.sort_by_key(|(index, _)| *index);
        let results: Vec<TestResult> = finished.into_iter().map(|(_, r)| r).collect();

        let count = |status: ResultStatus| results.iter().filter(|r| r.status == status).count();
        let passed = count(ResultStatus::Pass);
        let failed = count(ResultStatus::Fail);
        let skipped = count(ResultStatus::Skip);
        let duration_ms = start.elapsed().as_millis() as u64;

        info!("");
        info!(
            "Test Results: {} passed, {} failed, {} skipped ({} ms)",
            passed, failed, skipped, duration_ms
        );

        let suite = TestSuiteResult {
            total: results.len(),
            passed,
            failed,
            skipped,
            duration_ms,
            results,
        };

        if let Some(dir) = &self.config.output_dir {
            write_results(dir, &suite)?;
        }
        Ok(suite)
    }
}

/// Run one case, converting a panic into a failure, and record it.
pub fn run_case(fixture: &Fixture, case: &TestCase) -> TestResult {
    debug!("Running test: {}", case.name);
    let start = Instant::now();
    let mut recorder = CaseRecorder::start(Arc::clone(&fixture.results), case.name);

    let outcome = catch_unwind(AssertUnwindSafe(|| (case.run)(fixture)))
        .unwrap_or_else(|panic| Err(E2eError::AssertionFailed(panic_message(panic.as_ref()))));
    recorder.finish(&outcome);
    let status = recorder.status();
    drop(recorder);

    let duration_ms = start.elapsed().as_millis() as u64;
    let error = outcome.err().map(|e| e.to_string());
    match status {
        ResultStatus::Pass => info!("✓ {} ({} ms)", case.name, duration_ms),
        ResultStatus::Skip => info!("- {} skipped: {}", case.name, error.as_deref().unwrap_or("")),
        ResultStatus::Fail => error!("✗ {} - {}", case.name, error.as_deref().unwrap_or("unknown error")),
    }

    TestResult {
        name: case.name.to_string(),
        status,
        duration_ms,
        error,
    }
}

/// Write test results to `<dir>/test-results.json`
pub fn write_results(dir: &Path, results: &TestSuiteResult) -> E2eResult<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let path = dir.join("test-results.json");
    let json = serde_json::to_string_pretty(results)?;
    std::fs::write(&path, json)?;

    info!("Results written to: {}", path.display());
    Ok(path)
}
