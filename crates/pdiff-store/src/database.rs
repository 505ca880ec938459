//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::migrations;

/// How long a connection waits on another connection's write lock before
/// failing with `SQLITE_BUSY`.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Default database location, in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/pdiff/pdiff.db`
    /// - macOS:   `~/Library/Application Support/org.pdiff.pdiff/pdiff.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\pdiff\pdiff\data\pdiff.db`
    ///
    /// Creates the parent directory.
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("org", "pdiff", "pdiff").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        Ok(data_dir.join("pdiff.db"))
    }

    /// Open (or create) a database at an explicit path and bring its schema
    /// up to date. Run once per process before any [`Database::connect`].
    pub fn open_at(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        migrations::run_migrations(&conn)?;

        Self::configure(conn)
    }

    /// Open an additional connection to an already migrated database.
    ///
    /// Connections are cheap; the server opens one per operation so that
    /// work on different sites never waits on a shared handle. WAL mode lets
    /// readers proceed while another connection holds the write lock.
    pub fn connect(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        migrations::ensure_current(&conn)?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access, needed to open transactions.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Every blob id referenced by an image or diff row.
    pub fn referenced_blob_ids(&self) -> Result<HashSet<Uuid>> {
        let mut stmt = self.conn().prepare(
            "SELECT blob_id FROM images
             UNION
             SELECT blob_id FROM diffs WHERE blob_id IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = HashSet::new();
        for row in rows {
            let raw = row?;
            match Uuid::parse_str(&raw) {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(e) => tracing::warn!(blob = %raw, error = %e, "unparseable blob id"),
            }
        }
        Ok(ids)
    }
}
