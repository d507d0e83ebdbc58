//! Single-session orchestration.
//!
//! Each user message is logged and embedded, answered with a free-text generation informed by
//! recalled turns and the current world state, and then followed by a background structured
//! generation that refreshes the world state. At most one background generation runs at a
//! time: before the next message is handled the previous one is settled (soft stop, grace
//! period, forced cancel, bounded wait) and whatever it produced is merged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::db::{self, Persistence};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::GenerationError;
use crate::generation::prompt::{self, ChatPrompt};
use crate::generation::session::GenerationSession;
use crate::generation::{GenerationRequest, GenerationResult, Mode};
use crate::memory::index::{MemoryIndex, Query};
use crate::memory::turns::{RecalledTurn, TurnLog};
use crate::memory::types::{ConversationTurn, Role};
use crate::world_state::{FacetSchema, WorldStateModel};

/// What the user sees after sending a message.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub text: String,
    pub errors: Vec<GenerationError>,
    pub interrupted: bool,
    pub recalled: Vec<RecalledTurn>,
}

/// How a background world-state generation ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorldStateOutcome {
    /// Facets written by the merge; zero when nothing was merged.
    pub merged_facets: usize,
    pub interrupted: bool,
    /// Generation and persistence errors, rendered.
    pub errors: Vec<String>,
}

impl WorldStateOutcome {
    fn abandoned(reason: impl Into<String>) -> Self {
        Self {
            merged_facets: 0,
            interrupted: true,
            errors: vec![reason.into()],
        }
    }

    /// Text for a system-role log entry, when there is something to record.
    pub fn system_note(&self) -> Option<String> {
        let errors = self.errors.join("; ");
        match (self.merged_facets > 0, self.interrupted, self.errors.is_empty()) {
            (false, _, false) => Some(format!("[ERROR PROCESSING RESPONSE] {errors}")),
            (true, true, true) => Some("[PARTIAL RESPONSE DUE TO CANCELLATION]".into()),
            (true, true, false) => Some(format!("[PARTIAL RESPONSE DUE TO CANCELLATION] {errors}")),
            (true, false, false) => Some(format!("[ERROR] {errors}")),
            _ => None,
        }
    }
}

/// Apply a structured generation result to the model.
///
/// A failed attempt (no facets, at least one error) is never merged. Anything with facets is
/// merged, even when interrupted or alongside per-line errors.
pub fn apply_world_state(model: &mut WorldStateModel, result: GenerationResult) -> WorldStateOutcome {
    let failed = result.is_failed_attempt();
    let mut errors: Vec<String> = result.errors.iter().map(|e| e.to_string()).collect();
    let interrupted = result.interrupted;

    let mut merged_facets = 0;
    match result.aggregate.into_facets() {
        Some(facets) if !failed && !facets.is_empty() => {
            merged_facets = facets.len();
            if let Err(e) = model.merge(facets) {
                errors.push(e.to_string());
            }
        }
        Some(_) => {
            if failed {
                tracing::warn!(errors = %errors.join("; "), "world-state generation produced nothing, not merging");
            }
        }
        None => errors.push("world-state generation returned free text".into()),
    }

    WorldStateOutcome {
        merged_facets,
        interrupted,
        errors,
    }
}

/// Embed user and assistant turns that were stored without a vector, and record the link.
/// Returns how many turns were linked.
fn backfill_embeddings(
    turns: &mut [ConversationTurn],
    memory: &MemoryIndex,
    store: &dyn Persistence,
) -> usize {
    let mut linked = 0;
    for turn in turns
        .iter_mut()
        .filter(|t| t.role != Role::System && t.embedding_ref().is_none())
    {
        let index = match memory.add(&turn.content) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), turn = %turn.id, "turn still not embedded");
                continue;
            }
        };
        if let Err(e) = turn.assign_embedding_ref(index) {
            tracing::warn!(error = %e, "embedding reference not assigned");
            continue;
        }
        if let Err(e) = store.set_embedding_ref(&turn.id, index) {
            tracing::warn!(error = %format!("{e:#}"), turn = %turn.id, "embedding reference kept in memory only");
        }
        linked += 1;
    }
    if linked > 0 {
        tracing::info!(turns = linked, "embedded turns missing from the vector index");
    }
    linked
}

struct PendingWorldState {
    handle: JoinHandle<WorldStateOutcome>,
    soft_stop: Arc<AtomicBool>,
    token: CancellationToken,
}

pub struct Agent {
    config: AgentConfig,
    session: GenerationSession,
    store: Arc<dyn Persistence>,
    memory: Arc<MemoryIndex>,
    turns: TurnLog,
    world: Arc<Mutex<WorldStateModel>>,
    pending: Option<PendingWorldState>,
}

impl Agent {
    /// Open storage, the embedding model, and the vector index described by `config`.
    pub fn open(config: AgentConfig) -> Result<Self> {
        let store: Arc<dyn Persistence> = Arc::from(db::open_store(&config)?);
        let provider: Arc<dyn EmbeddingProvider> =
            Arc::from(embedding::create_provider(&config.embedding)?);
        Self::with_parts(config, store, provider)
    }

    /// Assemble an agent from already-open collaborators.
    pub fn with_parts(
        config: AgentConfig,
        store: Arc<dyn Persistence>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let schema = FacetSchema::resolve(&config.world_state.schema, &config.world_state.schemas)?;
        let memory = MemoryIndex::open(config.index_path(), provider)
            .context("failed to open vector index")?;
        let mut loaded = store.load_turns().context("failed to load turns")?;
        backfill_embeddings(&mut loaded, &memory, store.as_ref());
        let turns = TurnLog::from_turns(loaded);
        let world = WorldStateModel::load(schema, store.clone());
        let session = GenerationSession::new(&config.generation, &config.logging);

        tracing::info!(
            turns = turns.len(),
            vectors = memory.len()?,
            schema = world.schema().version(),
            "agent ready"
        );

        Ok(Self {
            config,
            session,
            store,
            memory: Arc::new(memory),
            turns,
            world: Arc::new(Mutex::new(world)),
            pending: None,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn turns(&self) -> &TurnLog {
        &self.turns
    }

    pub fn memory(&self) -> &MemoryIndex {
        &self.memory
    }

    pub fn world(&self) -> &Arc<Mutex<WorldStateModel>> {
        &self.world
    }

    pub fn has_pending_world_state(&self) -> bool {
        self.pending.is_some()
    }

    /// Record a turn: embed it (user and assistant turns only), persist it, keep it in the log.
    /// Embedding or storage failures are logged and the turn is kept in memory regardless.
    pub async fn log_turn(&mut self, role: Role, content: impl Into<String>) -> ConversationTurn {
        let mut turn = ConversationTurn::new(role, content);

        if role != Role::System {
            let memory = self.memory.clone();
            let text = turn.content.clone();
            match tokio::task::spawn_blocking(move || memory.add(&text)).await {
                Ok(Ok(index)) => {
                    if let Err(e) = turn.assign_embedding_ref(index) {
                        tracing::warn!(error = %e, "embedding reference not assigned");
                    }
                }
                Ok(Err(e)) => tracing::warn!(error = %format!("{e:#}"), "turn not embedded"),
                Err(e) => tracing::warn!(error = %e, "embedding task failed"),
            }
        }

        let store = self.store.clone();
        let stored = turn.clone();
        match tokio::task::spawn_blocking(move || store.append_turn(&stored)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %format!("{e:#}"), turn = %turn.id, "turn kept in memory only"),
            Err(e) => tracing::warn!(error = %e, "turn storage task failed"),
        }

        tracing::debug!(role = %role, turn = %turn.id, embedding_ref = ?turn.embedding_ref(), "turn logged");
        self.turns.push(turn.clone());
        turn
    }

    /// Prior turns most similar to `query`, closest first.
    pub async fn recall(&self, query: &str) -> Vec<RecalledTurn> {
        let memory = self.memory.clone();
        let query = query.to_string();
        let k = self.config.retrieval.recall_k;
        let hits = match tokio::task::spawn_blocking(move || memory.search(Query::Text(&query), k)).await {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                tracing::warn!(error = %format!("{e:#}"), "recall failed");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(error = %e, "recall task failed");
                return Vec::new();
            }
        };
        self.turns
            .recall(&hits, self.config.retrieval.max_recall_distance)
    }

    /// Answer one user message and start refreshing the world state in the background.
    ///
    /// Cancelling `token` cuts the reply short; the partial reply is still logged.
    pub async fn respond(&mut self, user_input: &str, token: &CancellationToken) -> ChatReply {
        self.settle_world_state().await;

        let recalled = self.recall(user_input).await;
        let history = self
            .turns
            .recent(self.config.generation.chat_history_window)
            .to_vec();
        let (schema, state) = {
            let world = self.world.lock().await;
            (world.schema().clone(), world.snapshot())
        };
        self.log_turn(Role::User, user_input).await;

        let payload = prompt::chat_payload(&ChatPrompt {
            persona: &self.config.generation.persona,
            schema: &schema,
            state: &state,
            recalled: &recalled,
            history: &history,
            user_input,
        });
        let request = GenerationRequest {
            payload,
            mode: Mode::FreeText,
        };
        let result = self.session.run(&request, || false, token).await;

        let text = result
            .aggregate
            .as_text()
            .unwrap_or_default()
            .trim_end()
            .to_string();
        if !text.is_empty() {
            self.log_turn(Role::Assistant, text.clone()).await;
        }
        if let Some(summary) = result.error_summary() {
            tracing::warn!(errors = %summary, "chat generation reported errors");
            self.log_turn(Role::System, format!("[ERROR] {summary}")).await;
        }

        self.start_world_state();

        ChatReply {
            text,
            errors: result.errors,
            interrupted: result.interrupted,
            recalled,
        }
    }

    /// Spawn the background world-state generation over the recent history.
    pub fn start_world_state(&mut self) {
        if self.pending.is_some() {
            tracing::warn!("world-state generation already running, not starting another");
            return;
        }

        let history = self
            .turns
            .recent(self.config.generation.world_state_history_window)
            .to_vec();
        let soft_stop = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();
        let world = self.world.clone();
        let session = self.session.clone();
        let stop = soft_stop.clone();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let (schema, state) = {
                let world = world.lock().await;
                (world.schema().clone(), world.snapshot())
            };
            let request = GenerationRequest {
                payload: prompt::world_state_payload(&schema, &state, &history),
                mode: Mode::Structured,
            };
            let result = session
                .run(&request, move || stop.load(Ordering::Relaxed), &task_token)
                .await;

            // Merging writes to storage; keep it off the async worker threads.
            let mut world = world.lock_owned().await;
            match tokio::task::spawn_blocking(move || apply_world_state(&mut world, result)).await {
                Ok(outcome) => outcome,
                Err(e) => WorldStateOutcome::abandoned(format!("world-state merge failed: {e}")),
            }
        });

        self.pending = Some(PendingWorldState {
            handle,
            soft_stop,
            token,
        });
    }

    /// Wait for the background generation to finish on its own.
    pub async fn wait_world_state(&mut self) -> Option<WorldStateOutcome> {
        let pending = self.pending.take()?;
        let outcome = match pending.handle.await {
            Ok(outcome) => outcome,
            Err(e) => WorldStateOutcome::abandoned(format!("world-state task failed: {e}")),
        };
        self.record_outcome(&outcome).await;
        Some(outcome)
    }

    /// Stop the background generation: soft stop, then forced cancel after the grace period,
    /// then abort after the timeout. Whatever it produced has been merged on return.
    pub async fn settle_world_state(&mut self) -> Option<WorldStateOutcome> {
        let pending = self.pending.take()?;
        let PendingWorldState {
            mut handle,
            soft_stop,
            token,
        } = pending;

        let joined = if handle.is_finished() {
            Some(handle.await)
        } else {
            tracing::debug!("wrapping up world-state generation");
            soft_stop.store(true, Ordering::Relaxed);
            let grace = Duration::from_millis(self.config.generation.cancel_grace_ms);
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    token.cancel();
                    let bound = Duration::from_millis(self.config.generation.cancel_timeout_ms);
                    match tokio::time::timeout(bound, &mut handle).await {
                        Ok(joined) => Some(joined),
                        Err(_) => {
                            handle.abort();
                            None
                        }
                    }
                }
            }
        };

        let outcome = match joined {
            Some(Ok(outcome)) => outcome,
            Some(Err(e)) => WorldStateOutcome::abandoned(format!("world-state task failed: {e}")),
            None => {
                tracing::warn!("world-state generation did not stop in time, aborted");
                WorldStateOutcome::abandoned("world-state generation did not stop in time")
            }
        };
        self.record_outcome(&outcome).await;
        Some(outcome)
    }

    async fn record_outcome(&mut self, outcome: &WorldStateOutcome) {
        tracing::info!(
            merged = outcome.merged_facets,
            interrupted = outcome.interrupted,
            errors = outcome.errors.len(),
            "world-state generation settled"
        );
        if let Some(note) = outcome.system_note() {
            self.log_turn(Role::System, note).await;
        }
    }

    /// Settle any background work before exit.
    pub async fn shutdown(&mut self) {
        self.settle_world_state().await;
        let mut world = self.world.clone().lock_owned().await;
        match tokio::task::spawn_blocking(move || world.retry_persist()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "world state not saved on exit"),
            Err(e) => tracing::warn!(error = %e, "world state save task failed"),
        }
    }
}
