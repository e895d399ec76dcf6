//! Direct SQLite inspection of the SUT's databases
//!
//! Each database gets at most one connection, opened on first use and kept
//! until [`Inspector::close`]. The single connection sits behind a mutex, so
//! concurrent tests queue on it instead of racing the SUT for locks; the 10 s
//! busy timeout absorbs the SUT's own writes. All reads autocommit and writes
//! are single statements.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, Value as SqlValue};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::Serialize;
use tracing::debug;

use arbor_common::{db, Role, Visibility};

use crate::error::{E2eError, E2eResult};
use crate::harness::DbPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Db {
    Nodes,
    Flows,
}

/// One step of a recorded flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowStep {
    pub seq: i64,
    pub name: String,
    pub status: String,
    pub detail: Option<String>,
}

/// One rung of the visibility strata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stratum {
    pub name: String,
    pub min_role: String,
    pub rank: i64,
}

pub struct Inspector {
    paths: DbPaths,
    nodes: Mutex<Option<Connection>>,
    flows: Mutex<Option<Connection>>,
}

impl Inspector {
    /// Nothing is opened until the first query.
    pub fn new(paths: DbPaths) -> Self {
        Self {
            paths,
            nodes: Mutex::new(None),
            flows: Mutex::new(None),
        }
    }

    pub fn paths(&self) -> &DbPaths {
        &self.paths
    }

    /// Metrics database path; held for callers, never opened here.
    pub fn metrics_path(&self) -> &Path {
        &self.paths.metrics
    }

    /// Drop both connections. A later query reopens lazily.
    pub fn close(&self) {
        let nodes = self.nodes.lock().take();
        let flows = self.flows.lock().take();
        for (name, conn) in [("nodes", nodes), ("flows", flows)] {
            if let Some(conn) = conn {
                if let Err((_, e)) = conn.close() {
                    debug!("Closing {} connection failed: {}", name, e);
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.nodes.lock().is_some() || self.flows.lock().is_some()
    }

    fn with_conn<T>(&self, which: Db, f: impl FnOnce(&Connection) -> E2eResult<T>) -> E2eResult<T> {
        let (slot, path) = match which {
            Db::Nodes => (&self.nodes, &self.paths.nodes),
            Db::Flows => (&self.flows, &self.paths.flows),
        };
        let mut guard = slot.lock();
        if guard.is_none() {
            let conn = db::open_configured(path).map_err(|e| {
                E2eError::AssertionFailed(format!("opening {}: {}", path.display(), e))
            })?;
            debug!("Inspector opened {:?} database", which);
            *guard = Some(conn);
        }
        let conn = guard
            .as_ref()
            .ok_or_else(|| E2eError::assertion(format!("{:?} connection unavailable", which)))?;
        f(conn)
    }

    // ========================================================================
    // Scalar queries
    // ========================================================================

    fn scalar_in(&self, which: Db, sql: &str, args: &[&dyn ToSql]) -> E2eResult<Option<SqlValue>> {
        self.with_conn(which, |conn| {
            conn.query_row(sql, args, |row| row.get::<_, SqlValue>(0))
                .optional()
                .map_err(sql_error(sql, args))
        })
    }

    fn scalar_int_in(&self, which: Db, sql: &str, args: &[&dyn ToSql]) -> E2eResult<i64> {
        match self.scalar_in(which, sql, args)? {
            Some(SqlValue::Integer(n)) => Ok(n),
            other => Err(E2eError::AssertionFailed(format!(
                "`{}` with args {} returned {:?}, expected an integer",
                sql,
                render_args(args),
                other
            ))),
        }
    }

    /// First column of the first row from the nodes database; `None` if no rows.
    pub fn query_scalar(&self, sql: &str, args: &[&dyn ToSql]) -> E2eResult<Option<SqlValue>> {
        self.scalar_in(Db::Nodes, sql, args)
    }

    pub fn query_scalar_int(&self, sql: &str, args: &[&dyn ToSql]) -> E2eResult<i64> {
        self.scalar_int_in(Db::Nodes, sql, args)
    }

    pub fn flows_scalar_int(&self, sql: &str, args: &[&dyn ToSql]) -> E2eResult<i64> {
        self.scalar_int_in(Db::Flows, sql, args)
    }

    /// Run one write statement against the nodes database.
    pub fn exec(&self, sql: &str, args: &[&dyn ToSql]) -> E2eResult<usize> {
        self.with_conn(Db::Nodes, |conn| {
            conn.execute(sql, args).map_err(sql_error(sql, args))
        })
    }

    /// Steps of a flow in sequence order.
    pub fn query_flow_steps(&self, flow_id: &str) -> E2eResult<Vec<FlowStep>> {
        const SQL: &str =
            "SELECT seq, name, status, detail FROM flow_steps WHERE flow_id = ?1 ORDER BY seq";
        self.with_conn(Db::Flows, |conn| {
            let mut stmt = conn.prepare(SQL).map_err(sql_error(SQL, &[&flow_id]))?;
            let steps = stmt
                .query_map(params![flow_id], |row| {
                    Ok(FlowStep {
                        seq: row.get(0)?,
                        name: row.get(1)?,
                        status: row.get(2)?,
                        detail: row.get(3)?,
                    })
                })
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(sql_error(SQL, &[&flow_id]))?;
            Ok(steps)
        })
    }

    /// Most recent flow recorded for a node, if any.
    pub fn latest_flow_for_node(&self, node_id: &str) -> E2eResult<Option<String>> {
        let value = self.scalar_in(
            Db::Flows,
            "SELECT id FROM flows WHERE node_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            &[&node_id],
        )?;
        Ok(match value {
            Some(SqlValue::Text(id)) => Some(id),
            _ => None,
        })
    }

    // ========================================================================
    // Assertions
    // ========================================================================

    pub fn row_count(&self, table: &str, where_clause: &str, args: &[&dyn ToSql]) -> E2eResult<i64> {
        check_identifier(table)?;
        let predicate = if where_clause.trim().is_empty() { "1=1" } else { where_clause };
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, predicate);
        self.query_scalar_int(&sql, args)
    }

    pub fn assert_row_count(
        &self,
        table: &str,
        where_clause: &str,
        args: &[&dyn ToSql],
        expected: i64,
    ) -> E2eResult<()> {
        let actual = self.row_count(table, where_clause, args)?;
        if actual != expected {
            return Err(E2eError::AssertionFailed(format!(
                "{} rows matching `{}` with args {}: expected {}, got {}",
                table,
                where_clause,
                render_args(args),
                expected,
                actual
            )));
        }
        Ok(())
    }

    pub fn assert_row_count_at_least(
        &self,
        table: &str,
        where_clause: &str,
        args: &[&dyn ToSql],
        minimum: i64,
    ) -> E2eResult<()> {
        let actual = self.row_count(table, where_clause, args)?;
        if actual < minimum {
            return Err(E2eError::AssertionFailed(format!(
                "{} rows matching `{}` with args {}: expected at least {}, got {}",
                table,
                where_clause,
                render_args(args),
                minimum,
                actual
            )));
        }
        Ok(())
    }

    /// The row exists, soft-deleted or not.
    pub fn assert_node_exists(&self, node_id: &str) -> E2eResult<()> {
        self.assert_row_count("nodes", "id = ?1", &[&node_id], 1)
    }

    /// Raw column value of a node row.
    pub fn node_field(&self, node_id: &str, column: &str) -> E2eResult<SqlValue> {
        check_identifier(column)?;
        let sql = format!("SELECT {} FROM nodes WHERE id = ?1", column);
        self.query_scalar(&sql, &[&node_id])?.ok_or_else(|| {
            E2eError::AssertionFailed(format!("`{}` with args [{:?}]: node not found", sql, node_id))
        })
    }

    pub fn assert_node_field(&self, node_id: &str, column: &str, expected: &dyn ToSql) -> E2eResult<()> {
        let actual = self.node_field(node_id, column)?;
        let expected = to_sql_value(expected)?;
        if actual != expected {
            return Err(E2eError::AssertionFailed(format!(
                "node {} column {}: expected {:?}, got {:?}",
                node_id, column, expected, actual
            )));
        }
        Ok(())
    }

    pub fn assert_node_field_at_least(&self, node_id: &str, column: &str, threshold: i64) -> E2eResult<()> {
        match self.node_field(node_id, column)? {
            SqlValue::Integer(n) if n >= threshold => Ok(()),
            other => Err(E2eError::AssertionFailed(format!(
                "node {} column {}: expected at least {}, got {:?}",
                node_id, column, threshold, other
            ))),
        }
    }

    // ========================================================================
    // Domain helpers
    // ========================================================================

    pub fn node_visibility(&self, node_id: &str) -> E2eResult<Visibility> {
        match self.node_field(node_id, "visibility")? {
            SqlValue::Text(raw) => raw.parse().map_err(E2eError::AssertionFailed),
            other => Err(E2eError::AssertionFailed(format!(
                "node {} has non-text visibility {:?}",
                node_id, other
            ))),
        }
    }

    /// Override a node's visibility behind the SUT's back.
    pub fn set_node_visibility(&self, node_id: &str, visibility: Visibility) -> E2eResult<()> {
        let changed = self.exec(
            "UPDATE nodes SET visibility = ?1 WHERE id = ?2",
            &[&visibility.as_str(), &node_id],
        )?;
        if changed != 1 {
            return Err(E2eError::AssertionFailed(format!(
                "set visibility of node {}: {} rows changed",
                node_id, changed
            )));
        }
        Ok(())
    }

    /// Soft-delete timestamp of a node, `None` while it is live.
    pub fn node_deleted_at(&self, node_id: &str) -> E2eResult<Option<String>> {
        match self.node_field(node_id, "deleted_at")? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(ts) => Ok(Some(ts)),
            other => Ok(Some(format!("{:?}", other))),
        }
    }

    /// Live clones of `source_id`, oldest first.
    pub fn clones_of(&self, source_id: &str) -> E2eResult<Vec<String>> {
        const SQL: &str =
            "SELECT id FROM nodes WHERE clone_of = ?1 AND deleted_at IS NULL ORDER BY created_at, rowid";
        self.with_conn(Db::Nodes, |conn| {
            let mut stmt = conn.prepare(SQL).map_err(sql_error(SQL, &[&source_id]))?;
            let ids = stmt
                .query_map(params![source_id], |row| row.get::<_, String>(0))
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(sql_error(SQL, &[&source_id]))?;
            Ok(ids)
        })
    }

    /// At least one clone of `source_id` exists; returns the oldest.
    pub fn assert_clone_exists(&self, source_id: &str) -> E2eResult<String> {
        self.clones_of(source_id)?
            .into_iter()
            .next()
            .ok_or_else(|| E2eError::AssertionFailed(format!("no clone of node {}", source_id)))
    }

    /// `clone_id` points back at `source_id`.
    pub fn assert_clone_linkage(&self, clone_id: &str, source_id: &str) -> E2eResult<()> {
        self.assert_node_field(clone_id, "clone_of", &source_id)
    }

    /// Visibility strata ordered by rank, lowest first.
    pub fn strata(&self) -> E2eResult<Vec<Stratum>> {
        const SQL: &str = "SELECT name, min_role, rank FROM strata ORDER BY rank";
        self.with_conn(Db::Nodes, |conn| {
            let mut stmt = conn.prepare(SQL).map_err(sql_error(SQL, &[]))?;
            let strata = stmt
                .query_map([], |row| {
                    Ok(Stratum {
                        name: row.get(0)?,
                        min_role: row.get(1)?,
                        rank: row.get(2)?,
                    })
                })
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(sql_error(SQL, &[]))?;
            Ok(strata)
        })
    }

    /// Strata names readable by `role`, per the stored table.
    pub fn strata_visible_to(&self, role: Role) -> E2eResult<Vec<String>> {
        let strata = self.strata()?;
        let mut visible = Vec::new();
        for stratum in strata {
            let min_role: Role = stratum.min_role.parse().map_err(E2eError::AssertionFailed)?;
            if min_role <= role {
                visible.push(stratum.name);
            }
        }
        Ok(visible)
    }

    pub fn user_role(&self, handle: &str) -> E2eResult<Role> {
        match self.query_scalar("SELECT role FROM users WHERE handle = ?1", &[&handle])? {
            Some(SqlValue::Text(raw)) => raw.parse().map_err(E2eError::AssertionFailed),
            other => Err(E2eError::AssertionFailed(format!(
                "role of user {}: got {:?}",
                handle, other
            ))),
        }
    }

    /// Promote or demote a user directly in the database.
    pub fn set_user_role(&self, handle: &str, role: Role) -> E2eResult<()> {
        let changed = self.exec(
            "UPDATE users SET role = ?1 WHERE handle = ?2",
            &[&role.as_str(), &handle],
        )?;
        if changed != 1 {
            return Err(E2eError::AssertionFailed(format!(
                "set role of user {}: {} rows changed",
                handle, changed
            )));
        }
        Ok(())
    }
}

/// Only plain identifiers may be spliced into SQL text.
fn check_identifier(name: &str) -> E2eResult<()> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(E2eError::AssertionFailed(format!("invalid SQL identifier `{}`", name)))
    }
}

fn to_sql_value(arg: &dyn ToSql) -> E2eResult<SqlValue> {
    match arg.to_sql()? {
        ToSqlOutput::Borrowed(value) => Ok(value.into()),
        ToSqlOutput::Owned(value) => Ok(value),
        #[allow(unreachable_patterns)]
        _ => Err(E2eError::assertion("unsupported SQL argument")),
    }
}

fn render_args(args: &[&dyn ToSql]) -> String {
    let rendered: Vec<String> = args
        .iter()
        .map(|arg| match to_sql_value(*arg) {
            Ok(value) => format!("{:?}", value),
            Err(_) => "<unrenderable>".to_string(),
        })
        .collect();
    format!("[{}]", rendered.join(", "))
}

fn sql_error<'a>(sql: &'a str, args: &'a [&'a dyn ToSql]) -> impl FnOnce(rusqlite::Error) -> E2eError + 'a {
    move |source| E2eError::Sql {
        query: sql.to_string(),
        args: render_args(args),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded() -> (TempDir, Inspector) {
        let dir = TempDir::new().unwrap();
        let paths = DbPaths {
            nodes: dir.path().join("nodes.db"),
            flows: dir.path().join("flows.db"),
            metrics: dir.path().join("metrics.db"),
        };
        let conn = db::open_configured(&paths.nodes).unwrap();
        db::init_nodes_schema(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO nodes (id, body, type, depth, slug, score) VALUES ('n1', 'root', 'claim', 0, 'root-n1', 7);
             INSERT INTO nodes (id, body, type, depth, parent_id) VALUES ('n2', 'child', 'piece', 1, 'n1');",
        )
        .unwrap();
        let flows = db::open_configured(&paths.flows).unwrap();
        db::init_flows_schema(&flows).unwrap();
        flows
            .execute_batch(
                "INSERT INTO flows (id, node_id, kind) VALUES ('f1', 'n1', 'ask');
                 INSERT INTO flow_steps (flow_id, seq, name, status) VALUES ('f1', 1, 'stored', 'ok');
                 INSERT INTO flow_steps (flow_id, seq, name, status) VALUES ('f1', 0, 'received', 'ok');",
            )
            .unwrap();
        (dir, Inspector::new(paths))
    }

    #[test]
    fn test_lazy_open_and_close() {
        let (_dir, inspector) = seeded();
        assert!(!inspector.is_open());
        inspector.assert_node_exists("n1").unwrap();
        assert!(inspector.is_open());
        inspector.close();
        assert!(!inspector.is_open());
        inspector.assert_node_exists("n2").unwrap();
    }

    #[test]
    fn test_field_assertions() {
        let (_dir, inspector) = seeded();
        inspector.assert_node_field("n2", "parent_id", &"n1").unwrap();
        inspector.assert_node_field("n1", "depth", &0i64).unwrap();
        inspector.assert_node_field_at_least("n1", "score", 5).unwrap();

        let err = inspector.assert_node_field_at_least("n1", "score", 8).unwrap_err();
        assert!(matches!(err, E2eError::AssertionFailed(_)));
        let err = inspector.assert_node_field("n1", "type", &"piece").unwrap_err();
        assert!(err.to_string().contains("expected"));
    }

    #[test]
    fn test_row_count_mismatch_names_query_and_args() {
        let (_dir, inspector) = seeded();
        inspector.assert_row_count("nodes", "", &[], 2).unwrap();
        inspector.assert_row_count_at_least("nodes", "depth >= ?1", &[&0i64], 2).unwrap();

        let err = inspector
            .assert_row_count("nodes", "parent_id = ?1", &[&"n1"], 3)
            .unwrap_err()
            .to_string();
        assert!(err.contains("parent_id = ?1"), "{}", err);
        assert!(err.contains("n1"), "{}", err);
        assert!(err.contains("got 1"), "{}", err);
    }

    #[test]
    fn test_rejects_injected_identifiers() {
        let (_dir, inspector) = seeded();
        assert!(inspector.node_field("n1", "body; DROP TABLE nodes").is_err());
        assert!(inspector.row_count("nodes--", "", &[]).is_err());
        inspector.assert_row_count("nodes", "", &[], 2).unwrap();
    }

    #[test]
    fn test_sql_error_carries_query() {
        let (_dir, inspector) = seeded();
        let err = inspector.query_scalar("SELECT nope FROM nodes", &[]).unwrap_err();
        match err {
            E2eError::Sql { query, .. } => assert_eq!(query, "SELECT nope FROM nodes"),
            other => panic!("expected Sql error, got {:?}", other),
        }
    }

    #[test]
    fn test_flow_steps_are_ordered() {
        let (_dir, inspector) = seeded();
        let steps = inspector.query_flow_steps("f1").unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["received", "stored"]);
        assert_eq!(inspector.latest_flow_for_node("n1").unwrap().as_deref(), Some("f1"));
        assert!(inspector.query_flow_steps("missing").unwrap().is_empty());
    }

    #[test]
    fn test_visibility_and_strata() {
        let (_dir, inspector) = seeded();
        assert_eq!(inspector.node_visibility("n1").unwrap(), Visibility::Public);
        inspector.set_node_visibility("n1", Visibility::Research).unwrap();
        assert_eq!(inspector.node_visibility("n1").unwrap(), Visibility::Research);
        assert!(inspector.set_node_visibility("missing", Visibility::Public).is_err());

        let names: Vec<String> = inspector.strata().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["public", "research", "provider", "instance"]);
        assert_eq!(inspector.strata_visible_to(Role::Researcher).unwrap(), ["public", "research"]);
    }

    #[test]
    fn test_clone_linkage() {
        let (_dir, inspector) = seeded();
        assert!(inspector.assert_clone_exists("n1").is_err());
        inspector
            .exec(
                "INSERT INTO nodes (id, body, type, depth, clone_of) VALUES ('c1', 'root', 'claim', 0, ?1)",
                &[&"n1"],
            )
            .unwrap();
        assert_eq!(inspector.assert_clone_exists("n1").unwrap(), "c1");
        inspector.assert_clone_linkage("c1", "n1").unwrap();
        assert!(inspector.assert_clone_linkage("c1", "n2").is_err());
    }

    #[test]
    fn test_open_failure_is_reported_and_recoverable() {
        let dir = TempDir::new().unwrap();
        let missing_parent = dir.path().join("absent").join("nodes.db");
        let inspector = Inspector::new(DbPaths {
            nodes: missing_parent,
            flows: dir.path().join("flows.db"),
            metrics: dir.path().join("metrics.db"),
        });
        assert!(inspector.assert_node_exists("x").is_err());
        assert!(!inspector.is_open());
    }
}
