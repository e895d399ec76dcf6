//! SQLite persistence for the reference server
//!
//! One connection per database, each behind a mutex:
//! - nodes.db: users, nodes, strata
//! - flows.db: flows, flow_steps
//! - metrics.db: request_metrics

use arbor_common::config::DatabaseConfig;
use arbor_common::{db, NodeType, Result, Role, Visibility};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct UserRow {
    pub id: String,
    pub handle: String,
    pub role: Role,
    #[serde(skip)]
    pub password_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeRow {
    pub id: String,
    pub body: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub depth: i64,
    pub parent_id: Option<String>,
    pub slug: Option<String>,
    pub visibility: Visibility,
    pub author_id: Option<String>,
    pub clone_of: Option<String>,
    pub tags: Vec<String>,
    pub score: i64,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

/// Input for a node insert
pub struct NewNode<'a> {
    pub body: &'a str,
    pub node_type: NodeType,
    pub parent: Option<&'a NodeRow>,
    pub visibility: Visibility,
    pub author_id: &'a str,
    pub clone_of: Option<&'a str>,
    pub tags: &'a [String],
}

pub struct Store {
    nodes: Mutex<Connection>,
    flows: Mutex<Connection>,
    metrics: Mutex<Connection>,
}

const USER_COLUMNS: &str = "id, handle, role, password_hash, created_at";
const NODE_COLUMNS: &str =
    "id, body, type, depth, parent_id, slug, visibility, author_id, clone_of, tags, score, created_at, deleted_at";

impl Store {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let nodes = db::open_configured(&config.path)?;
        db::init_nodes_schema(&nodes)?;
        let flows = db::open_configured(&config.flows_path)?;
        db::init_flows_schema(&flows)?;
        let metrics = db::open_configured(&config.metrics_path)?;
        db::init_metrics_schema(&metrics)?;

        info!("Opened databases under {:?}", config.path.parent());
        Ok(Self {
            nodes: Mutex::new(nodes),
            flows: Mutex::new(flows),
            metrics: Mutex::new(metrics),
        })
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Insert a user. Returns `None` when the handle is taken.
    pub fn create_user(&self, handle: &str, password_hash: &str) -> Result<Option<UserRow>> {
        let conn = self.nodes.lock();
        let id = Uuid::new_v4().to_string();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (id, handle, password_hash, role) VALUES (?1, ?2, ?3, 'user')",
            params![id, handle, password_hash],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        debug!("Created user {} ({})", handle, id);
        query_user(&conn, "id = ?1", &id)
    }

    pub fn user_by_handle(&self, handle: &str) -> Result<Option<UserRow>> {
        query_user(&self.nodes.lock(), "handle = ?1", handle)
    }

    pub fn user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        query_user(&self.nodes.lock(), "id = ?1", id)
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    pub fn insert_node(&self, new: NewNode<'_>) -> Result<NodeRow> {
        let conn = self.nodes.lock();
        let id = Uuid::new_v4().to_string();
        let (depth, parent_id) = match new.parent {
            Some(parent) => (parent.depth + 1, Some(parent.id.as_str())),
            None => (0, None),
        };
        let slug = parent_id.is_none().then(|| slugify(new.body, &id));

        conn.execute(
            "INSERT INTO nodes (id, body, type, depth, parent_id, slug, visibility, author_id, clone_of, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                new.body,
                new.node_type.as_str(),
                depth,
                parent_id,
                slug,
                new.visibility.as_str(),
                new.author_id,
                new.clone_of,
                serde_json::to_string(new.tags)?,
            ],
        )?;
        debug!("Inserted node {} at depth {}", id, depth);

        query_node(&conn, "id = ?1", &id)?.ok_or_else(|| {
            arbor_common::Error::InvalidConfig(format!("node {} vanished after insert", id))
        })
    }

    /// Live node by id; soft-deleted rows are excluded.
    pub fn node(&self, id: &str) -> Result<Option<NodeRow>> {
        query_node(&self.nodes.lock(), "id = ?1 AND deleted_at IS NULL", id)
    }

    pub fn children(&self, parent_id: &str) -> Result<Vec<NodeRow>> {
        let conn = self.nodes.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes WHERE parent_id = ?1 AND deleted_at IS NULL ORDER BY created_at, id",
            NODE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![parent_id], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Live root nodes, newest first.
    pub fn questions(&self) -> Result<Vec<NodeRow>> {
        let conn = self.nodes.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes WHERE parent_id IS NULL AND deleted_at IS NULL
             ORDER BY created_at DESC, rowid DESC",
            NODE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn soft_delete(&self, id: &str) -> Result<bool> {
        let conn = self.nodes.lock();
        let changed = conn.execute(
            "UPDATE nodes SET deleted_at = CURRENT_TIMESTAMP WHERE id = ?1 AND deleted_at IS NULL",
            params![id],
        )?;
        Ok(changed == 1)
    }

    // ========================================================================
    // Flows and metrics
    // ========================================================================

    /// Record a flow and its ordered steps. Returns the flow id.
    pub fn record_flow(&self, node_id: &str, kind: &str, steps: &[(&str, &str)]) -> Result<String> {
        let mut conn = self.flows.lock();
        let flow_id = Uuid::new_v4().to_string();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO flows (id, node_id, kind) VALUES (?1, ?2, ?3)",
            params![flow_id, node_id, kind],
        )?;
        for (seq, (name, status)) in steps.iter().enumerate() {
            tx.execute(
                "INSERT INTO flow_steps (flow_id, seq, name, status) VALUES (?1, ?2, ?3, ?4)",
                params![flow_id, seq as i64, name, status],
            )?;
        }
        tx.commit()?;
        Ok(flow_id)
    }

    pub fn bump_metric(&self, method: &str, path: &str) -> Result<()> {
        self.metrics.lock().execute(
            "INSERT INTO request_metrics (method, path, count) VALUES (?1, ?2, 1)
             ON CONFLICT(method, path) DO UPDATE SET count = count + 1",
            params![method, path],
        )?;
        Ok(())
    }
}

fn query_user(conn: &Connection, predicate: &str, arg: &str) -> Result<Option<UserRow>> {
    let user = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, predicate),
            params![arg],
            |row| {
                let role: String = row.get(2)?;
                Ok(UserRow {
                    id: row.get(0)?,
                    handle: row.get(1)?,
                    role: role.parse().unwrap_or(Role::Anon),
                    password_hash: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(user)
}

fn query_node(conn: &Connection, predicate: &str, arg: &str) -> Result<Option<NodeRow>> {
    let node = conn
        .query_row(
            &format!("SELECT {} FROM nodes WHERE {}", NODE_COLUMNS, predicate),
            params![arg],
            node_from_row,
        )
        .optional()?;
    Ok(node)
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeRow> {
    let node_type: String = row.get(2)?;
    let visibility: String = row.get(6)?;
    let tags: String = row.get(9)?;
    Ok(NodeRow {
        id: row.get(0)?,
        body: row.get(1)?,
        node_type: node_type.parse().unwrap_or_default(),
        depth: row.get(3)?,
        parent_id: row.get(4)?,
        slug: row.get(5)?,
        visibility: visibility.parse().unwrap_or_default(),
        author_id: row.get(7)?,
        clone_of: row.get(8)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        score: row.get(10)?,
        created_at: row.get(11)?,
        deleted_at: row.get(12)?,
    })
}

/// Lowercase dash-separated words from the body, suffixed with the id prefix.
fn slugify(body: &str, id: &str) -> String {
    let words: Vec<String> = body
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .take(8)
        .map(|w| w.to_ascii_lowercase())
        .collect();
    let base = if words.is_empty() {
        "node".to_string()
    } else {
        words.join("-")
    };
    format!("{}-{}", base, &id[..8.min(id.len())])
}
