use std::collections::HashMap;

use anyhow::{anyhow, Result};

use super::{JsonlStore, Persistence, SqliteStore};
use crate::memory::types::ConversationTurn;
use crate::world_state::WorldState;

/// Database first, flat files as fallback.
///
/// Writes go to both backends and fail only if both fail, so either side may be missing
/// writes the other has. Reads reconcile: turns are the union of both logs in creation
/// order, and the world state comes from whichever side saved last.
pub struct MirroredStore {
    db: SqliteStore,
    files: JsonlStore,
}

impl MirroredStore {
    pub fn new(db: SqliteStore, files: JsonlStore) -> Self {
        Self { db, files }
    }

    fn write_both(
        &self,
        what: &str,
        db_write: impl FnOnce(&SqliteStore) -> Result<()>,
        file_write: impl FnOnce(&JsonlStore) -> Result<()>,
    ) -> Result<()> {
        let db_res = db_write(&self.db);
        let file_res = file_write(&self.files);
        match (db_res, file_res) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => {
                tracing::warn!(error = %format!("{e:#}"), "database write of {what} failed, kept in files");
                Ok(())
            }
            (Ok(()), Err(e)) => {
                tracing::warn!(error = %format!("{e:#}"), "file write of {what} failed, kept in database");
                Ok(())
            }
            (Err(db_err), Err(file_err)) => Err(anyhow!(
                "failed to store {what}: database: {db_err:#}; files: {file_err:#}"
            )),
        }
    }
}

/// Union of both turn logs by id, ordered by creation time. Database order wins for equal
/// timestamps; an embedding ref known to either side is kept.
fn reconcile_turns(
    db_turns: Vec<ConversationTurn>,
    file_turns: Vec<ConversationTurn>,
) -> Vec<ConversationTurn> {
    let mut from_files: HashMap<String, ConversationTurn> =
        file_turns.iter().map(|t| (t.id.clone(), t.clone())).collect();

    let mut turns = Vec::with_capacity(db_turns.len().max(file_turns.len()));
    for turn in db_turns {
        match from_files.remove(&turn.id) {
            Some(file_turn) if turn.embedding_ref().is_none() && file_turn.embedding_ref().is_some() => {
                turns.push(file_turn)
            }
            _ => turns.push(turn),
        }
    }

    let missing: Vec<ConversationTurn> = file_turns
        .into_iter()
        .filter(|t| from_files.contains_key(&t.id))
        .collect();
    if !missing.is_empty() {
        tracing::info!(count = missing.len(), "restoring turns that only reached the files");
        turns.extend(missing);
        turns.sort_by_key(|t| chrono::DateTime::parse_from_rfc3339(&t.created_at).ok());
    }
    turns
}

impl Persistence for MirroredStore {
    fn append_turn(&self, turn: &ConversationTurn) -> Result<()> {
        self.write_both("turn", |db| db.append_turn(turn), |f| f.append_turn(turn))
    }

    fn set_embedding_ref(&self, turn_id: &str, index: usize) -> Result<()> {
        self.write_both(
            "embedding reference",
            |db| db.set_embedding_ref(turn_id, index),
            |f| f.set_embedding_ref(turn_id, index),
        )
    }

    fn load_turns(&self) -> Result<Vec<ConversationTurn>> {
        let db_turns = match self.db.load_turns() {
            Ok(turns) => turns,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "loading turns from database failed, loading from file");
                return self.files.load_turns();
            }
        };
        match self.files.load_turns() {
            Ok(file_turns) => Ok(reconcile_turns(db_turns, file_turns)),
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "loading turns from file failed, using database only");
                Ok(db_turns)
            }
        }
    }

    fn save_world_state_snapshot(&self, state: &WorldState, schema_version: &str) -> Result<()> {
        self.write_both(
            "world state",
            |db| db.save_world_state_snapshot(state, schema_version),
            |f| f.save_world_state_snapshot(state, schema_version),
        )
    }

    fn load_last_world_state(&self) -> Result<Option<WorldState>> {
        let db = match self.db.last_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "loading world state from database failed, loading from file");
                return self.files.load_last_world_state();
            }
        };
        let files = self.files.last_snapshot().unwrap_or_else(|e| {
            tracing::warn!(error = %format!("{e:#}"), "world state history file unreadable");
            None
        });

        match (db, files) {
            (Some(db), Some(files)) if files.created_at > db.created_at => Ok(Some(files.state)),
            (Some(db), _) => Ok(Some(db.state)),
            (None, _) => self.files.load_last_world_state(),
        }
    }
}
