//! Durable storage for turns and world-state snapshots.
//!
//! Everything goes through the [`Persistence`] trait. Three backends exist: [`SqliteStore`],
//! [`JsonlStore`], and [`MirroredStore`] (database first, files as fallback). The backend is
//! chosen by `storage.backend` via [`open_store`].

pub mod jsonl;
pub mod migrations;
pub mod mirrored;
pub mod schema;
pub mod sqlite;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;

use crate::config::AgentConfig;
use crate::memory::types::ConversationTurn;
use crate::world_state::WorldState;

pub use jsonl::JsonlStore;
pub use mirrored::MirroredStore;
pub use sqlite::SqliteStore;

/// Storage for the turn log and world-state snapshots.
///
/// All methods are synchronous. Implementations must survive a process restart.
pub trait Persistence: Send + Sync {
    fn append_turn(&self, turn: &ConversationTurn) -> Result<()>;

    /// Link an already-stored turn to its index row. Fails if the turn is unknown or
    /// already linked.
    fn set_embedding_ref(&self, turn_id: &str, index: usize) -> Result<()>;

    /// All turns in the order they were appended.
    fn load_turns(&self) -> Result<Vec<ConversationTurn>>;

    fn save_world_state_snapshot(&self, state: &WorldState, schema_version: &str) -> Result<()>;

    /// The most recent snapshot, or `None` if nothing was ever saved.
    fn load_last_world_state(&self) -> Result<Option<WorldState>>;
}

/// A stored world state and when it was saved.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub created_at: DateTime<Utc>,
    pub state: WorldState,
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("bad timestamp {value:?}"))?
        .with_timezone(&Utc))
}

/// Build the configured backend under the data directory.
pub fn open_store(config: &AgentConfig) -> Result<Box<dyn Persistence>> {
    match config.storage.backend.as_str() {
        "sqlite" => Ok(Box::new(SqliteStore::open(config.db_path())?)),
        "jsonl" => Ok(Box::new(JsonlStore::new(
            config.turns_path(),
            config.state_path(),
            config.state_history_path(),
        )?)),
        "mirrored" => {
            let files = JsonlStore::new(
                config.turns_path(),
                config.state_path(),
                config.state_history_path(),
            )?;
            match SqliteStore::open(config.db_path()) {
                Ok(db) => Ok(Box::new(MirroredStore::new(db, files))),
                Err(e) => {
                    tracing::warn!(error = %format!("{e:#}"), "database unavailable, using file storage only");
                    Ok(Box::new(files))
                }
            }
        }
        other => bail!("unknown storage backend: {other}. Supported: sqlite, jsonl, mirrored"),
    }
}

/// Open (or create) the database at the given path with schema initialized.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;

    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Open an in-memory database with schema and migrations applied.
pub fn open_memory_database() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;
    Ok(conn)
}

/// Write `contents` to `path` through a temp file and rename, so readers never see a torn file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {} to {}", tmp_path.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_store_rejects_unknown_backend() {
        let mut config = AgentConfig::default();
        config.storage.backend = "postgres".into();
        let err = open_store(&config).err().unwrap();
        assert!(err.to_string().contains("unknown storage backend: postgres"));
    }

    #[test]
    fn write_atomic_replaces_contents() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("state.json");
        write_atomic(&path, b"{\"a\":1}").unwrap();
        write_atomic(&path, b"{\"a\":2}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        assert!(!path.with_extension("tmp").exists());
    }
}
