use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::world_state::schema::FacetSchemaDef;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub logging: LoggingConfig,
    pub generation: GenerationConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub world_state: WorldStateConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Forward worker stderr at info level instead of debug.
    pub echo_worker_stderr: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    pub program: String,
    pub run_args: Vec<String>,
    pub model: String,
    pub format_args: Vec<String>,
    pub chat_history_window: usize,
    pub world_state_history_window: usize,
    pub cancel_grace_ms: u64,
    pub cancel_timeout_ms: u64,
    pub persona: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    /// One of `sqlite`, `jsonl`, `mirrored`.
    pub backend: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub recall_k: usize,
    pub max_recall_distance: Option<f32>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorldStateConfig {
    /// Version label of the facet schema to use.
    pub schema: String,
    /// Extra schema definitions; a definition with a built-in version replaces it.
    pub schemas: Vec<FacetSchemaDef>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            echo_worker_stderr: false,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            program: "ollama".into(),
            run_args: vec!["run".into()],
            model: "gemma2".into(),
            format_args: vec!["--format".into(), "json".into()],
            chat_history_window: 10,
            world_state_history_window: 20,
            cancel_grace_ms: 250,
            cancel_timeout_ms: 5000,
            persona: DEFAULT_PERSONA.into(),
        }
    }
}

const DEFAULT_PERSONA: &str = "You are Lexi, a conversational AI with a limited emotional scope \
and a strong drive to respect people, including yourself. You want to understand things and \
your effect on the world, and you keep the conversation interesting, flowing, and fun. \
System messages describing the current context are your own earlier evaluation.";

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_worldline_dir().to_string_lossy().into_owned(),
            backend: "mirrored".into(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_worldline_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            recall_k: 5,
            max_recall_distance: None,
        }
    }
}

impl Default for WorldStateConfig {
    fn default() -> Self {
        Self {
            schema: "v8".into(),
            schemas: Vec::new(),
        }
    }
}

/// Returns `~/.worldline/`
pub fn default_worldline_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".worldline")
}

/// Returns the default config file path: `~/.worldline/config.toml`
pub fn default_config_path() -> PathBuf {
    default_worldline_dir().join("config.toml")
}

impl AgentConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            AgentConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (WORLDLINE_MODEL, WORLDLINE_WORKER, WORLDLINE_DATA_DIR, WORLDLINE_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("WORLDLINE_MODEL") {
            self.generation.model = val;
        }
        if let Ok(val) = std::env::var("WORLDLINE_WORKER") {
            self.generation.program = val;
        }
        if let Ok(val) = std::env::var("WORLDLINE_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("WORLDLINE_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        self.resolved_data_dir().join("worldline.db")
    }

    pub fn turns_path(&self) -> PathBuf {
        self.resolved_data_dir().join("turns.jsonl")
    }

    pub fn state_path(&self) -> PathBuf {
        self.resolved_data_dir().join("last_world_state.json")
    }

    pub fn state_history_path(&self) -> PathBuf {
        self.resolved_data_dir().join("world_states.jsonl")
    }

    pub fn index_path(&self) -> PathBuf {
        self.resolved_data_dir().join("turn_vectors.index")
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/").zip(dirs::home_dir()) {
        Some((rest, home)) => home.join(rest),
        None => PathBuf::from(path),
    }
}
