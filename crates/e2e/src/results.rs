//! Append-only results log
//!
//! Every test case outcome becomes one row of `test_results`. The log is an
//! audit trail, not part of the test contract: if it cannot be opened,
//! recording is disabled, and a failed insert drops that row. Neither case
//! reaches the test.
//!
//! While a [`CaseRecorder`] is live, the last HTTP exchange made on its
//! thread is kept and lands in the row's `request`/`response` columns.

use std::any::Any;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use arbor_common::{db, ResultStatus};

use crate::error::E2eResult;

/// Per-status counts of rows written by one store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResultSummary {
    pub pass: usize,
    pub fail: usize,
    pub skip: usize,
    /// Records lost to a disabled store or a failed insert
    pub dropped: usize,
}

impl ResultSummary {
    pub fn recorded(&self) -> usize {
        self.pass + self.fail + self.skip
    }
}

struct Inner {
    conn: Option<Connection>,
    summary: ResultSummary,
}

pub struct ResultsStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl ResultsStore {
    /// Open (creating if needed) the results database. Never fails; an
    /// unusable database yields a disabled store.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let conn = match open_results_db(&path) {
            Ok(conn) => {
                debug!("Recording results to {}", path.display());
                Some(conn)
            }
            Err(e) => {
                warn!("Results log disabled ({}): {}", path.display(), e);
                None
            }
        };
        Self {
            path,
            inner: Mutex::new(Inner {
                conn,
                summary: ResultSummary::default(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().conn.is_some()
    }

    /// Append one row. Errors are swallowed.
    pub fn record(
        &self,
        test_name: &str,
        status: ResultStatus,
        duration_ms: u64,
        request: Option<&Value>,
        response: Option<&Value>,
        error: Option<&str>,
    ) {
        let request = request.map(Value::to_string);
        let response = response.map(Value::to_string);

        let mut inner = self.inner.lock();
        let written = match inner.conn.as_ref() {
            Some(conn) => conn
                .execute(
                    "INSERT INTO test_results (test_name, status, duration_ms, request, response, error)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        test_name,
                        status.as_str(),
                        duration_ms as i64,
                        request,
                        response,
                        error
                    ],
                )
                .map_err(|e| debug!("Dropped result for {}: {}", test_name, e))
                .is_ok(),
            None => false,
        };

        let summary = &mut inner.summary;
        if !written {
            summary.dropped += 1;
            return;
        }
        match status {
            ResultStatus::Pass => summary.pass += 1,
            ResultStatus::Fail => summary.fail += 1,
            ResultStatus::Skip => summary.skip += 1,
        }
    }

    /// Counts of what this store has written since it was opened.
    pub fn summary(&self) -> ResultSummary {
        self.inner.lock().summary
    }

    /// Close the handle. Later records are dropped.
    pub fn close(&self) {
        if let Some(conn) = self.inner.lock().conn.take() {
            if let Err((_, e)) = conn.close() {
                debug!("Closing results log failed: {}", e);
            }
        }
    }
}

fn open_results_db(path: &Path) -> E2eResult<Connection> {
    let conn = db::open_configured(path)?;
    db::init_results_schema(&conn)?;
    Ok(conn)
}

// ============================================================================
// Process-global store
// ============================================================================

static GLOBAL: Lazy<Mutex<Option<Arc<ResultsStore>>>> = Lazy::new(|| Mutex::new(None));

/// Open the global store at `path`. A second call returns the existing store.
pub fn init_global(path: impl AsRef<Path>) -> Arc<ResultsStore> {
    let mut global = GLOBAL.lock();
    if let Some(store) = global.as_ref() {
        return Arc::clone(store);
    }
    let store = Arc::new(ResultsStore::open(path));
    *global = Some(Arc::clone(&store));
    store
}

pub fn global() -> Option<Arc<ResultsStore>> {
    GLOBAL.lock().clone()
}

/// Record into the global store; a no-op when none is open.
pub fn record(
    test_name: &str,
    status: ResultStatus,
    duration_ms: u64,
    request: Option<&Value>,
    response: Option<&Value>,
    error: Option<&str>,
) {
    if let Some(store) = global() {
        store.record(test_name, status, duration_ms, request, response, error);
    }
}

/// Close the global store and clear the reference.
pub fn close_global() {
    if let Some(store) = GLOBAL.lock().take() {
        store.close();
    }
}

/// Clear the global reference if it points at `store`.
pub(crate) fn release_global(store: &Arc<ResultsStore>) {
    let mut global = GLOBAL.lock();
    if global.as_ref().map_or(false, |g| Arc::ptr_eq(g, store)) {
        *global = None;
    }
}

// ============================================================================
// Per-case recording
// ============================================================================

#[derive(Default)]
struct Observed {
    request: Option<Value>,
    response: Option<Value>,
}

thread_local! {
    // Some while a recorder is live on this thread
    static OBSERVED: RefCell<Option<Observed>> = const { RefCell::new(None) };
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Attach a request/response pair to the case running on this thread.
/// Later calls replace earlier ones; a no-op outside a case.
pub fn note_exchange(request: Value, response: Value) {
    let _ = OBSERVED.try_with(|slot| {
        if let Ok(mut slot) = slot.try_borrow_mut() {
            if let Some(observed) = slot.as_mut() {
                observed.request = Some(request);
                observed.response = Some(response);
            }
        }
    });
}

fn take_observed() -> Observed {
    OBSERVED
        .try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut s| s.take()))
        .ok()
        .flatten()
        .unwrap_or_default()
}

fn take_last_panic() -> Option<String> {
    LAST_PANIC
        .try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut s| s.take()))
        .ok()
        .flatten()
}

/// Keep the message of every panic in a thread-local so a recorder dropped
/// during the unwind can report it. Chains to the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let message = panic_message(info.payload());
            let _ = LAST_PANIC.try_with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    *slot = Some(message);
                }
            });
            previous(info);
        }));
    });
}

/// `panicked: <message>` for a panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Times one test case and records it when dropped.
///
/// The outcome is whatever the case reported through [`CaseRecorder::finish`],
/// [`CaseRecorder::fail`] or [`CaseRecorder::skip`]; an unwinding panic
/// always records a failure.
pub struct CaseRecorder {
    store: Arc<ResultsStore>,
    name: String,
    start: Instant,
    request: Option<Value>,
    response: Option<Value>,
    outcome: Option<(ResultStatus, Option<String>)>,
}

impl CaseRecorder {
    pub fn start(store: Arc<ResultsStore>, name: impl Into<String>) -> Self {
        install_panic_hook();
        take_last_panic();
        let _ = OBSERVED.try_with(|slot| {
            if let Ok(mut slot) = slot.try_borrow_mut() {
                *slot = Some(Observed::default());
            }
        });
        Self {
            store,
            name: name.into(),
            start: Instant::now(),
            request: None,
            response: None,
            outcome: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Explicit payloads win over the exchange observed on this thread.
    pub fn set_request(&mut self, request: Value) {
        self.request = Some(request);
    }

    pub fn set_response(&mut self, response: Value) {
        self.response = Some(response);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.outcome = Some((ResultStatus::Fail, Some(error.into())));
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.outcome = Some((ResultStatus::Skip, Some(reason.into())));
    }

    /// Take the outcome from a case's result.
    pub fn finish<T>(&mut self, result: &E2eResult<T>) {
        self.outcome = Some(match result {
            Ok(_) => (ResultStatus::Pass, None),
            Err(e) if e.is_skip() => (ResultStatus::Skip, Some(e.to_string())),
            Err(e) => (ResultStatus::Fail, Some(e.to_string())),
        });
    }

    /// Status that would be recorded if the guard dropped now.
    pub fn status(&self) -> ResultStatus {
        if std::thread::panicking() {
            return ResultStatus::Fail;
        }
        self.outcome
            .as_ref()
            .map(|(status, _)| *status)
            .unwrap_or(ResultStatus::Pass)
    }
}

impl Drop for CaseRecorder {
    fn drop(&mut self) {
        let (status, error) = if std::thread::panicking() {
            let message = take_last_panic().unwrap_or_else(|| "panicked".to_string());
            (ResultStatus::Fail, Some(message))
        } else {
            self.outcome.take().unwrap_or((ResultStatus::Pass, None))
        };
        let observed = take_observed();
        let request = self.request.take().or(observed.request);
        let response = self.response.take().or(observed.response);

        let duration_ms = self.start.elapsed().as_millis() as u64;
        self.store.record(
            &self.name,
            status,
            duration_ms,
            request.as_ref(),
            response.as_ref(),
            error.as_deref(),
        );
    }
}
