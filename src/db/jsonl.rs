//! Flat-file persistence.
//!
//! Turns are appended to a JSONL file. The latest world state is rewritten whole on every
//! save (temp file + rename), and each snapshot is also appended to a history JSONL file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{Persistence, Snapshot};
use crate::memory::types::ConversationTurn;
use crate::world_state::WorldState;

pub struct JsonlStore {
    turns_path: PathBuf,
    state_path: PathBuf,
    history_path: PathBuf,
    /// Serializes appends so concurrent writers never interleave partial lines.
    write_lock: Mutex<()>,
}

/// One line of the world-state history file.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotLine {
    id: String,
    facet_schema: String,
    created_at: String,
    state: WorldState,
}

impl JsonlStore {
    pub fn new(
        turns_path: impl Into<PathBuf>,
        state_path: impl Into<PathBuf>,
        history_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let store = Self {
            turns_path: turns_path.into(),
            state_path: state_path.into(),
            history_path: history_path.into(),
            write_lock: Mutex::new(()),
        };
        for path in [&store.turns_path, &store.state_path, &store.history_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create directory {}", parent.display()))?;
            }
        }
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|e| anyhow::anyhow!("file store lock poisoned: {e}"))
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        let _guard = self.lock()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
        file.sync_data()?;
        Ok(())
    }

    /// The newest entry of the history file with its save time.
    pub fn last_snapshot(&self) -> Result<Option<Snapshot>> {
        read_jsonl::<SnapshotLine>(&self.history_path)?
            .pop()
            .map(|line| -> Result<Snapshot> {
                Ok(Snapshot {
                    created_at: super::parse_timestamp(&line.created_at)?,
                    state: line.state,
                })
            })
            .transpose()
    }
}

/// Read every parseable line; malformed lines are logged and skipped.
fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "not found, starting empty");
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut out = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(value) => out.push(value),
            Err(e) => tracing::warn!(path = %path.display(), line = n + 1, error = %e, "skipping malformed line"),
        }
    }
    Ok(out)
}

impl Persistence for JsonlStore {
    fn append_turn(&self, turn: &ConversationTurn) -> Result<()> {
        let line = serde_json::to_string(turn)?;
        self.append_line(&self.turns_path, &line)
    }

    fn set_embedding_ref(&self, turn_id: &str, index: usize) -> Result<()> {
        let _guard = self.lock()?;
        let mut turns: Vec<ConversationTurn> = read_jsonl(&self.turns_path)?;
        turns
            .iter_mut()
            .find(|t| t.id == turn_id)
            .with_context(|| format!("no turn with id {turn_id}"))?
            .assign_embedding_ref(index)?;

        let mut contents = String::new();
        for turn in &turns {
            contents.push_str(&serde_json::to_string(turn)?);
            contents.push('\n');
        }
        super::write_atomic(&self.turns_path, contents.as_bytes())
    }

    fn load_turns(&self) -> Result<Vec<ConversationTurn>> {
        read_jsonl(&self.turns_path)
    }

    fn save_world_state_snapshot(&self, state: &WorldState, schema_version: &str) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        super::write_atomic(&self.state_path, &json)?;

        let line = SnapshotLine {
            id: uuid::Uuid::now_v7().to_string(),
            facet_schema: schema_version.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            state: state.clone(),
        };
        self.append_line(&self.history_path, &serde_json::to_string(&line)?)
    }

    fn load_last_world_state(&self) -> Result<Option<WorldState>> {
        if !self.state_path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.state_path)
            .with_context(|| format!("failed to read {}", self.state_path.display()))?;
        let state = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", self.state_path.display()))?;
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Role;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> JsonlStore {
        JsonlStore::new(
            dir.path().join("turns.jsonl"),
            dir.path().join("last_world_state.json"),
            dir.path().join("world_states.jsonl"),
        )
        .unwrap()
    }

    #[test]
    fn empty_store_loads_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert!(store.load_turns().unwrap().is_empty());
        assert!(store.load_last_world_state().unwrap().is_none());
    }

    #[test]
    fn turns_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let turn = ConversationTurn::new(Role::User, "remember me");
        store(&tmp).append_turn(&turn).unwrap();

        let reopened = store(&tmp);
        assert_eq!(reopened.load_turns().unwrap(), vec![turn]);
    }

    #[test]
    fn malformed_turn_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.append_turn(&ConversationTurn::new(Role::User, "one")).unwrap();
        store.append_line(&tmp.path().join("turns.jsonl"), "{not a turn").unwrap();
        store.append_turn(&ConversationTurn::new(Role::User, "two")).unwrap();

        let contents: Vec<String> = store
            .load_turns()
            .unwrap()
            .into_iter()
            .map(|t| t.content)
            .collect();
        assert_eq!(contents, vec!["one", "two"]);
    }

    #[test]
    fn snapshot_rewrites_state_and_appends_history() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let mut state = WorldState::new();
        state.insert("KnowledgeGap".into(), json!("tides"));
        store.save_world_state_snapshot(&state, "v8").unwrap();
        state.insert("KnowledgeGap".into(), json!("moons"));
        store.save_world_state_snapshot(&state, "v8").unwrap();

        let last = store.load_last_world_state().unwrap().unwrap();
        assert_eq!(last["KnowledgeGap"], json!("moons"));
        let history = std::fs::read_to_string(tmp.path().join("world_states.jsonl")).unwrap();
        assert_eq!(history.lines().count(), 2);
        assert_eq!(store.last_snapshot().unwrap().unwrap().state, last);
    }

    #[test]
    fn embedding_ref_is_rewritten_in_place() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let first = ConversationTurn::new(Role::User, "one");
        let second = ConversationTurn::new(Role::Assistant, "two");
        store.append_turn(&first).unwrap();
        store.append_turn(&second).unwrap();

        store.set_embedding_ref(&second.id, 7).unwrap();
        let turns = store.load_turns().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].embedding_ref(), None);
        assert_eq!(turns[1].embedding_ref(), Some(7));
        assert!(store.set_embedding_ref(&second.id, 8).is_err());
        assert!(store.set_embedding_ref("missing", 0).is_err());
    }

    #[test]
    fn corrupt_state_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        std::fs::write(tmp.path().join("last_world_state.json"), "{oops").unwrap();
        assert!(store.load_last_world_state().is_err());
    }
}
