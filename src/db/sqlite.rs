use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::{Persistence, Snapshot};
use crate::memory::types::{ConversationTurn, Role};
use crate::world_state::WorldState;

/// SQLite-backed turn log and world-state history.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_connection(super::open_database(path)?))
    }

    /// Wrap an already-initialized connection (e.g. [`super::open_memory_database`]).
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("database lock poisoned: {e}"))
    }

    /// The newest snapshot with its save time.
    pub fn last_snapshot(&self) -> Result<Option<Snapshot>> {
        let conn = self.lock()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT state, created_at FROM world_states ORDER BY seq DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(state, created_at)| -> Result<Snapshot> {
            Ok(Snapshot {
                created_at: super::parse_timestamp(&created_at)?,
                state: serde_json::from_str(&state)
                    .context("stored world state is not a JSON object")?,
            })
        })
        .transpose()
    }
}

impl Persistence for SqliteStore {
    fn append_turn(&self, turn: &ConversationTurn) -> Result<()> {
        let conn = self.lock()?;
        let embedding_ref = turn.embedding_ref().map(|i| i as i64);
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO turns (id, role, content, created_at, embedding_ref) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![turn.id, turn.role.as_str(), turn.content, turn.created_at, embedding_ref],
            )
            .context("failed to insert turn")?;
        if inserted == 0 {
            tracing::warn!(id = %turn.id, "duplicate turn id, skipping");
        }
        Ok(())
    }

    fn set_embedding_ref(&self, turn_id: &str, index: usize) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE turns SET embedding_ref = ?1 WHERE id = ?2 AND embedding_ref IS NULL",
                params![index as i64, turn_id],
            )
            .context("failed to update embedding reference")?;
        if updated == 0 {
            bail!("no unlinked turn with id {turn_id}");
        }
        Ok(())
    }

    fn load_turns(&self) -> Result<Vec<ConversationTurn>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, role, content, created_at, embedding_ref FROM turns ORDER BY seq",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut turns = Vec::with_capacity(rows.len());
        for (id, role, content, created_at, embedding_ref) in rows {
            let role: Role = role.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let embedding_ref = embedding_ref.and_then(|i| usize::try_from(i).ok());
            turns.push(ConversationTurn::restore(id, role, content, created_at, embedding_ref));
        }
        Ok(turns)
    }

    fn save_world_state_snapshot(&self, state: &WorldState, schema_version: &str) -> Result<()> {
        let conn = self.lock()?;
        let json = serde_json::to_string(state)?;
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO world_states (state, created_at, facet_schema) VALUES (?1, ?2, ?3)",
            params![json, now, schema_version],
        )
        .context("failed to insert world state")?;
        Ok(())
    }

    fn load_last_world_state(&self) -> Result<Option<WorldState>> {
        Ok(self.last_snapshot()?.map(|snapshot| snapshot.state))
    }
}
