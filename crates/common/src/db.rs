//! SQLite connection policy and schemas for the Arbor databases
//!
//! Three databases belong to the server (nodes, flows, metrics). A fourth,
//! the results database, belongs to the harness and outlives any server run.

use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::types::Visibility;
use crate::Result;

/// How long a connection waits on a locked database before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a connection with the shared policy: busy timeout, WAL, FKs on.
pub fn open_configured(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path.as_ref())?;
    configure(&conn)?;
    debug!("Opened sqlite database at {:?}", path.as_ref());
    Ok(conn)
}

/// Apply the connection policy to an already open connection.
pub fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

pub const NODES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    handle TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'user'
        CHECK(role IN ('anon','user','researcher','provider','operator')),
    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    type TEXT NOT NULL CHECK(type IN ('claim','piece')),
    depth INTEGER NOT NULL DEFAULT 0 CHECK(depth >= 0),
    parent_id TEXT REFERENCES nodes(id),
    slug TEXT,
    visibility TEXT NOT NULL DEFAULT 'public'
        CHECK(visibility IN ('public','research','provider','instance')),
    author_id TEXT REFERENCES users(id),
    clone_of TEXT REFERENCES nodes(id),
    tags TEXT NOT NULL DEFAULT '[]',
    score INTEGER NOT NULL DEFAULT 0,
    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
    deleted_at DATETIME
);
CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id);
CREATE INDEX IF NOT EXISTS idx_nodes_clone_of ON nodes(clone_of);
CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_slug ON nodes(slug) WHERE slug IS NOT NULL;

CREATE TABLE IF NOT EXISTS strata (
    name TEXT PRIMARY KEY,
    min_role TEXT NOT NULL,
    rank INTEGER NOT NULL UNIQUE
);
"#;

pub const FLOWS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flows (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_flows_node ON flows(node_id);

CREATE TABLE IF NOT EXISTS flow_steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    flow_id TEXT NOT NULL REFERENCES flows(id),
    seq INTEGER NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    detail TEXT,
    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(flow_id, seq)
);
"#;

pub const METRICS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS request_metrics (
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (method, path)
);
"#;

pub const RESULTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS test_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    test_name TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('pass','fail','skip')),
    duration_ms INTEGER NOT NULL,
    request TEXT,
    response TEXT,
    error TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_test_results_name ON test_results(test_name);
CREATE INDEX IF NOT EXISTS idx_test_results_status ON test_results(status);
"#;

/// Create the nodes schema and seed the visibility strata.
pub fn init_nodes_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(NODES_SCHEMA)?;
    for (rank, stratum) in Visibility::ALL.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO strata (name, min_role, rank) VALUES (?1, ?2, ?3)",
            params![stratum.as_str(), stratum.min_role().as_str(), rank as i64],
        )?;
    }
    debug!("Nodes schema initialized");
    Ok(())
}

pub fn init_flows_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(FLOWS_SCHEMA)?;
    debug!("Flows schema initialized");
    Ok(())
}

pub fn init_metrics_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(METRICS_SCHEMA)?;
    Ok(())
}

pub fn init_results_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(RESULTS_SCHEMA)?;
    Ok(())
}
