#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use rusqlite::Connection;
use tempfile::TempDir;
use worldline::config::{AgentConfig, GenerationConfig, LoggingConfig};
use worldline::db::{self, JsonlStore, MirroredStore, Persistence, SqliteStore};
use worldline::embedding::EmbeddingProvider;
use worldline::generation::session::GenerationSession;
use worldline::memory::index::MemoryIndex;

/// Dimension of [`HashEmbedder`] vectors.
pub const TEST_DIM: usize = 16;

/// Embedder whose model is unavailable: every call fails.
pub struct OfflineEmbedder;

impl EmbeddingProvider for OfflineEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("embedding model not loaded")
    }

    fn dimensions(&self) -> usize {
        TEST_DIM
    }
}

/// Deterministic embedder: a normalized histogram of hashed words.
/// Texts sharing words land closer together.
pub struct HashEmbedder;

impl EmbeddingProvider for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; TEST_DIM];
        for word in text.split_whitespace() {
            let h = word
                .to_lowercase()
                .bytes()
                .fold(2166136261u32, |h, b| (h ^ b as u32).wrapping_mul(16777619));
            v[h as usize % TEST_DIM] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        TEST_DIM
    }
}

pub fn embedder() -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashEmbedder)
}

/// A vector with a single 1.0 at position `seed`.
pub fn spike(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; TEST_DIM];
    v[seed % TEST_DIM] = 1.0;
    v
}

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    db::open_memory_database().unwrap()
}

pub fn index_in(dir: &TempDir) -> MemoryIndex {
    MemoryIndex::open(dir.path().join("turn_vectors.index"), embedder()).unwrap()
}

pub fn jsonl_store(dir: &Path) -> JsonlStore {
    JsonlStore::new(
        dir.join("turns.jsonl"),
        dir.join("last_world_state.json"),
        dir.join("world_states.jsonl"),
    )
    .unwrap()
}

pub fn mirrored_store(dir: &Path) -> MirroredStore {
    MirroredStore::new(
        SqliteStore::open(dir.join("worldline.db")).unwrap(),
        jsonl_store(dir),
    )
}

/// Config rooted in `dir` that runs the shell script `worker` as the generation program.
pub fn test_config(dir: &Path, worker: &Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.storage.data_dir = dir.to_string_lossy().into_owned();
    config.storage.backend = "mirrored".into();
    config.generation.program = "/bin/sh".into();
    config.generation.run_args = vec![worker.to_string_lossy().into_owned()];
    config.generation.cancel_grace_ms = 100;
    config.generation.cancel_timeout_ms = 2000;
    config
}

pub fn store_for(config: &AgentConfig) -> Arc<dyn Persistence> {
    Arc::from(db::open_store(config).unwrap())
}

/// Session that runs the shell script `worker` through `/bin/sh`.
/// The script sees the model as `$1`, the payload as `$2`, and format args after that.
pub fn worker_session(worker: &Path) -> GenerationSession {
    let generation = GenerationConfig {
        program: "/bin/sh".into(),
        run_args: vec![worker.to_string_lossy().into_owned()],
        ..GenerationConfig::default()
    };
    GenerationSession::new(&generation, &LoggingConfig::default())
}

/// Write a shell script standing in for the generation worker.
pub fn write_worker(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    path
}
