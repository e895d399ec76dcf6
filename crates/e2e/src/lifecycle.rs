//! Shared fixture lifecycle
//!
//! One harness and one inspector per test process. The first [`Lifecycle::ensure`]
//! starts the SUT; every later call, from any thread, gets the same pair. A
//! failed start is remembered and never retried. Teardown runs in reverse
//! construction order: inspector, harness (which removes the data dir),
//! results log. Teardown waits for an in-flight start, and a start that
//! finishes after teardown began stops its own SUT.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::{E2eError, E2eResult};
use crate::harness::Harness;
use crate::inspector::Inspector;
use crate::options::HarnessOptions;
use crate::results::{self, ResultsStore};

/// Everything a test case needs
pub struct Fixture {
    pub harness: Arc<Harness>,
    pub inspector: Arc<Inspector>,
    pub results: Arc<ResultsStore>,
}

pub struct Lifecycle {
    options: HarnessOptions,
    results: Arc<ResultsStore>,
    fixture: OnceCell<Result<Fixture, String>>,
    // Held across initialization and by teardown
    init_lock: Mutex<()>,
    init_count: AtomicUsize,
    torn_down: AtomicBool,
}

impl Lifecycle {
    /// Standalone lifecycle with its own results store.
    pub fn new(options: HarnessOptions) -> Self {
        let results = Arc::new(ResultsStore::open(&options.results_path));
        Self::with_results(options, results)
    }

    pub fn with_results(options: HarnessOptions, results: Arc<ResultsStore>) -> Self {
        Self {
            options,
            results,
            fixture: OnceCell::new(),
            init_lock: Mutex::new(()),
            init_count: AtomicUsize::new(0),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &HarnessOptions {
        &self.options
    }

    pub fn results(&self) -> &Arc<ResultsStore> {
        &self.results
    }

    /// Start the SUT on first use and return the shared fixture.
    pub fn ensure(&self) -> E2eResult<&Fixture> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(torn_down_error());
        }
        let cell = match self.fixture.get() {
            Some(cell) => cell,
            None => {
                let _init = self.init_lock.lock();
                if self.torn_down.load(Ordering::SeqCst) {
                    return Err(torn_down_error());
                }
                self.fixture.get_or_init(|| self.initialize())
            }
        };
        match cell {
            Ok(fixture) => Ok(fixture),
            Err(reason) => Err(E2eError::SetupFailed(reason.clone())),
        }
    }

    fn initialize(&self) -> Result<Fixture, String> {
        self.init_count.fetch_add(1, Ordering::SeqCst);
        info!("Starting shared E2E fixture");

        let harness = Harness::start(&self.options).map_err(|e| {
            error!("E2E setup failed: {}", e);
            e.to_string()
        })?;
        if self.torn_down.load(Ordering::SeqCst) {
            warn!("Teardown began during setup; stopping the new SUT");
            if let Err(e) = harness.stop() {
                warn!("Stopping harness failed: {}", e);
            }
            return Err("lifecycle torn down during setup".to_string());
        }
        let inspector = Inspector::new(harness.db_paths().clone());

        Ok(Fixture {
            harness: Arc::new(harness),
            inspector: Arc::new(inspector),
            results: Arc::clone(&self.results),
        })
    }

    /// Number of initialization sequences that have run.
    pub fn init_count(&self) -> usize {
        self.init_count.load(Ordering::SeqCst)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Close the inspector, stop the SUT, close the results log. Runs once;
    /// errors are logged.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Tearing down shared E2E fixture");

        let _init = self.init_lock.lock();
        if let Some(Ok(fixture)) = self.fixture.get() {
            fixture.inspector.close();
            if let Err(e) = fixture.harness.stop() {
                warn!("Stopping harness failed: {}", e);
            }
        }

        self.results.close();
        results::release_global(&self.results);
    }
}

fn torn_down_error() -> E2eError {
    E2eError::SetupFailed("lifecycle already torn down".to_string())
}

// ============================================================================
// Process-global lifecycle
// ============================================================================

static SHARED: OnceCell<Lifecycle> = OnceCell::new();

/// Configure the process-global lifecycle. Returns false if it was already
/// configured (explicitly or by an earlier [`shared`] call).
pub fn configure_shared(options: HarnessOptions) -> bool {
    let mut installed = false;
    SHARED.get_or_init(|| {
        installed = true;
        global_lifecycle(options)
    });
    installed
}

/// The process-global lifecycle, configured from the environment if nothing
/// configured it first. Its owner must call [`Lifecycle::teardown`].
pub fn shared() -> &'static Lifecycle {
    SHARED.get_or_init(|| global_lifecycle(HarnessOptions::from_env()))
}

fn global_lifecycle(options: HarnessOptions) -> Lifecycle {
    let results = results::init_global(&options.results_path);
    Lifecycle::with_results(options, results)
}
