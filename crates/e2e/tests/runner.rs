//! Suite runner against the reference server

mod support;

use rusqlite::Connection;
use serde_json::Value;
use tempfile::TempDir;

use arbor_common::ResultStatus;
use arbor_e2e::{
    require_status, E2eError, E2eResult, Fixture, Lifecycle, RunnerConfig, TestCase, TestRunner,
};

fn status_check(fx: &Fixture) -> E2eResult<()> {
    let resp = fx.harness.get("/api/bot/status", None)?;
    require_status(&resp, 200)
}

fn needs_provider(_: &Fixture) -> E2eResult<()> {
    Err(E2eError::skipped("no provider"))
}

fn blows_up(_: &Fixture) -> E2eResult<()> {
    panic!("boom from case");
}

struct Row {
    name: String,
    status: String,
    request: Option<String>,
    response: Option<String>,
    error: Option<String>,
}

fn rows(path: &std::path::Path) -> Vec<Row> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare("SELECT test_name, status, request, response, error FROM test_results ORDER BY id")
        .unwrap();
    let rows = stmt
        .query_map([], |row| {
            Ok(Row {
                name: row.get(0)?,
                status: row.get(1)?,
                request: row.get(2)?,
                response: row.get(3)?,
                error: row.get(4)?,
            })
        })
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap();
    rows
}

#[test]
fn test_run_records_pass_skip_and_panic() {
    support::init_tracing();
    let scratch = TempDir::new().unwrap();
    let options = support::options(&scratch);
    let results_path = options.results_path.clone();
    let lifecycle = Lifecycle::new(options);

    let mut runner = TestRunner::new(RunnerConfig {
        concurrency: 2,
        output_dir: Some(scratch.path().join("out")),
        ..RunnerConfig::default()
    });
    runner.add_all(&[
        TestCase::new("Runner.status", status_check),
        TestCase::new("Runner.provider", needs_provider),
        TestCase::new("Runner.panic", blows_up),
    ]);

    let suite = runner.run(&lifecycle).unwrap();
    assert_eq!(
        (suite.total, suite.passed, suite.skipped, suite.failed),
        (3, 1, 1, 1)
    );
    assert!(!suite.success());
    let names: Vec<&str> = suite.results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["Runner.status", "Runner.provider", "Runner.panic"]);
    assert_eq!(suite.results[2].status, ResultStatus::Fail);
    assert!(scratch.path().join("out").join("test-results.json").is_file());

    // The run tears the lifecycle down.
    assert!(lifecycle.is_torn_down());
    assert_eq!(lifecycle.init_count(), 1);

    let rows = rows(&results_path);
    let by_name = |name: &str| rows.iter().find(|r| r.name == name).unwrap();
    assert_eq!(rows.len(), 3);

    let pass = by_name("Runner.status");
    assert_eq!(pass.status, "pass");
    assert!(pass.error.is_none());
    let request: Value = serde_json::from_str(pass.request.as_deref().unwrap()).unwrap();
    let response: Value = serde_json::from_str(pass.response.as_deref().unwrap()).unwrap();
    assert_eq!(request["method"], "GET");
    assert_eq!(request["path"], "/api/bot/status");
    assert_eq!(response["status"], 200);
    assert!(response["body"].is_object(), "{}", response);

    let skip = by_name("Runner.provider");
    assert_eq!(skip.status, "skip");
    assert!(skip.error.as_deref().unwrap().contains("no provider"));
    assert!(skip.request.is_none() && skip.response.is_none());

    let panic = by_name("Runner.panic");
    assert_eq!(panic.status, "fail");
    assert!(
        panic.error.as_deref().unwrap().contains("panicked: boom from case"),
        "{:?}",
        panic.error
    );
}
