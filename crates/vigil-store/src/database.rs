use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::StoreError;
use crate::ids::SessionId;
use crate::node::{Node, Stat};
use crate::schema;

/// Thread-safe SQLite handle holding the node table.
/// Uses parking_lot::Mutex for synchronous access (rusqlite is not Sync).
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create a node database at the given path.
    ///
    /// Ephemeral nodes left behind by a previous process are discarded, since
    /// no session survives a restart.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Database(format!("create dir: {e}")))?;
        }

        let conn = Connection::open(path)?;
        init(&conn)?;

        let purged = conn.execute("DELETE FROM nodes WHERE ephemeral_owner IS NOT NULL", [])?;
        info!(path = %path.display(), purged, "node database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
        })
    }

    /// Open an in-memory database (for testing and simulation).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, path: &str) -> Result<Option<Node>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT data, version, ephemeral_owner, created_at, modified_at
                 FROM nodes WHERE path = ?1",
                [path],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((data, version, owner, created_at, modified_at)) = row else {
            return Ok(None);
        };

        Ok(Some(Node {
            data,
            stat: Stat {
                version: version as u64,
                ephemeral_owner: owner.map(SessionId::from_stored),
                created_at: parse_timestamp(&created_at)?,
                modified_at: parse_timestamp(&modified_at)?,
            },
        }))
    }

    pub fn insert(
        &self,
        path: &str,
        data: &[u8],
        owner: Option<&SessionId>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nodes (path, data, version, ephemeral_owner, created_at, modified_at)
             VALUES (?1, ?2, 0, ?3, ?4, ?4)",
            rusqlite::params![path, data, owner.map(|s| s.as_str()), now],
        )?;
        Ok(())
    }

    /// Overwrite an existing node's payload, version and owner.
    pub fn update(
        &self,
        path: &str,
        data: &[u8],
        version: u64,
        owner: Option<&SessionId>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE nodes SET data = ?2, version = ?3, ephemeral_owner = ?4, modified_at = ?5
             WHERE path = ?1",
            rusqlite::params![path, data, version as i64, owner.map(|s| s.as_str()), now],
        )?;
        if changed == 0 {
            return Err(StoreError::NoNode(path.to_string()));
        }
        Ok(())
    }

    pub fn delete(&self, path: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM nodes WHERE path = ?1", [path])?;
        Ok(removed > 0)
    }

    /// Paths of all ephemeral nodes owned by `owner`.
    pub fn owned_by(&self, owner: &SessionId) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT path FROM nodes WHERE ephemeral_owner = ?1 ORDER BY path")?;
        let rows = stmt
            .query_map([owner.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    /// All node paths, sorted.
    pub fn paths(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT path FROM nodes ORDER BY path")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            path: self.path.clone(),
        }
    }
}

fn init(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(schema::PRAGMAS)
        .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;

    conn.execute_batch(schema::CREATE_TABLES)
        .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [schema::SCHEMA_VERSION],
            )
            .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;
        }
        Some(v) if v != schema::SCHEMA_VERSION => {
            return Err(StoreError::Database(format!(
                "unsupported schema version {v} (expected {})",
                schema::SCHEMA_VERSION
            )));
        }
        Some(_) => {}
    }
    Ok(())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("corrupt timestamp {raw:?}: {e}")))
}
