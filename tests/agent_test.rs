#![cfg(unix)]

mod helpers;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use worldline::agent::Agent;
use worldline::config::AgentConfig;
use worldline::db::Persistence;
use worldline::error::GenerationError;
use worldline::memory::types::{ConversationTurn, Role};
use worldline::world_state::WorldState;

/// Chat replies with a fixed line; structured runs emit one good facet and one bad line.
const CHATTY_WORKER: &str = r#"if [ "$3" = "--format" ]; then
  printf '%s\n' '{"CurrentState":{"newValue":"x"}}' '{bad json'
else
  printf 'Hello from the worker\n'
fi"#;

/// Store whose snapshot saves take half a second and report when they start and end.
struct SlowSnapshots {
    inner: Arc<dyn Persistence>,
    started: AtomicBool,
    finished: AtomicBool,
}

impl Persistence for SlowSnapshots {
    fn append_turn(&self, turn: &ConversationTurn) -> anyhow::Result<()> {
        self.inner.append_turn(turn)
    }

    fn set_embedding_ref(&self, turn_id: &str, index: usize) -> anyhow::Result<()> {
        self.inner.set_embedding_ref(turn_id, index)
    }

    fn load_turns(&self) -> anyhow::Result<Vec<ConversationTurn>> {
        self.inner.load_turns()
    }

    fn save_world_state_snapshot(&self, state: &WorldState, schema_version: &str) -> anyhow::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(500));
        let saved = self.inner.save_world_state_snapshot(state, schema_version);
        self.finished.store(true, Ordering::SeqCst);
        saved
    }

    fn load_last_world_state(&self) -> anyhow::Result<Option<WorldState>> {
        self.inner.load_last_world_state()
    }
}

fn agent(config: AgentConfig) -> Agent {
    let store = helpers::store_for(&config);
    Agent::with_parts(config, store, helpers::embedder()).unwrap()
}

fn setup(tmp: &TempDir, body: &str) -> AgentConfig {
    let worker = helpers::write_worker(tmp.path(), "worker.sh", body);
    helpers::test_config(tmp.path(), &worker)
}

async fn wait_for(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        assert!(Instant::now() < deadline, "worker never reached {}", path.display());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn reply_logs_turns_and_refreshes_world_state() {
    let tmp = TempDir::new().unwrap();
    let config = setup(&tmp, CHATTY_WORKER);
    let mut agent = agent(config.clone());

    let reply = agent.respond("what's going on?", &CancellationToken::new()).await;
    assert_eq!(reply.text, "Hello from the worker");
    assert!(reply.errors.is_empty());
    assert!(agent.has_pending_world_state());

    let outcome = agent.wait_world_state().await.unwrap();
    assert_eq!(outcome.merged_facets, 1);
    assert_eq!(outcome.errors.len(), 1);
    assert!(!outcome.interrupted);

    let turns = agent.turns().all();
    let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::System]);
    assert_eq!(turns[0].embedding_ref(), Some(0));
    assert_eq!(turns[1].embedding_ref(), Some(1));
    assert_eq!(turns[2].embedding_ref(), None);
    assert!(turns[2].content.starts_with("[ERROR] JSON decoding error"));

    {
        let world = agent.world().lock().await;
        assert_eq!(world.get("CurrentState"), Some(&json!({"newValue": "x"})));
    }

    // Everything is back after a restart.
    drop(agent);
    let agent = self::agent(config);
    assert_eq!(agent.turns().len(), 3);
    assert_eq!(agent.memory().len().unwrap(), 2);
    let world = agent.world().lock().await;
    assert_eq!(world.get("CurrentState"), Some(&json!({"newValue": "x"})));
}

#[tokio::test]
async fn recall_finds_earlier_turns() {
    let tmp = TempDir::new().unwrap();
    let config = setup(&tmp, CHATTY_WORKER);
    let mut agent = agent(config);

    agent.respond("tell me about the tide tables", &CancellationToken::new()).await;
    agent.settle_world_state().await;

    let recalled = agent.recall("tell me about the tide tables").await;
    assert!(!recalled.is_empty());
    assert_eq!(recalled[0].turn.content, "tell me about the tide tables");
    assert_eq!(recalled[0].turn.role, Role::User);
}

#[tokio::test]
async fn turns_stored_without_vectors_are_embedded_on_reopen() {
    let tmp = TempDir::new().unwrap();
    let config = setup(&tmp, CHATTY_WORKER);
    {
        let store = helpers::store_for(&config);
        let mut agent =
            Agent::with_parts(config.clone(), store, Arc::new(helpers::OfflineEmbedder)).unwrap();
        agent.respond("tell me about the tide tables", &CancellationToken::new()).await;
        agent.wait_world_state().await;
        assert!(agent.turns().all().iter().all(|t| t.embedding_ref().is_none()));
        assert!(agent.memory().is_empty().unwrap());
    }

    let agent = self::agent(config.clone());
    let turns = agent.turns().all();
    assert_eq!(turns[0].embedding_ref(), Some(0));
    assert_eq!(turns[1].embedding_ref(), Some(1));
    assert_eq!(turns[2].embedding_ref(), None);
    let recalled = agent.recall("tell me about the tide tables").await;
    assert_eq!(recalled[0].turn.content, "tell me about the tide tables");
    drop(agent);

    // The links were stored, so nothing is embedded twice.
    let agent = self::agent(config);
    assert_eq!(agent.memory().len().unwrap(), 2);
    assert_eq!(agent.turns().all()[1].embedding_ref(), Some(1));
}

#[tokio::test]
async fn world_state_save_does_not_stall_the_runtime() {
    let tmp = TempDir::new().unwrap();
    let config = setup(&tmp, CHATTY_WORKER);
    let store = Arc::new(SlowSnapshots {
        inner: helpers::store_for(&config),
        started: AtomicBool::new(false),
        finished: AtomicBool::new(false),
    });
    let mut agent = Agent::with_parts(config, store.clone(), helpers::embedder()).unwrap();
    agent.respond("hi", &CancellationToken::new()).await;

    // Single-threaded runtime: this loop only runs mid-save if the save is off the runtime thread.
    let deadline = Instant::now() + Duration::from_secs(10);
    while !store.started.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "snapshot was never saved");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!store.finished.load(Ordering::SeqCst));

    let outcome = agent.wait_world_state().await.unwrap();
    assert_eq!(outcome.merged_facets, 1);
    assert!(store.finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn settling_a_running_task_keeps_its_partial_state() {
    let tmp = TempDir::new().unwrap();
    let marker = tmp.path().join("structured-started");
    let body = format!(
        r#"if [ "$3" = "--format" ]; then
  printf '{{"KnowledgeGap":"tides"}}\n'
  touch '{}'
  exec sleep 30
else
  printf 'Sure.\n'
fi"#,
        marker.display()
    );
    let config = setup(&tmp, &body);
    let mut agent = agent(config);

    agent.respond("hi", &CancellationToken::new()).await;
    wait_for(&marker).await;

    let started = Instant::now();
    let outcome = agent.settle_world_state().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(outcome.interrupted);
    assert_eq!(outcome.merged_facets, 1);
    {
        let world = agent.world().lock().await;
        assert_eq!(world.get("KnowledgeGap"), Some(&json!("tides")));
    }
    let last = agent.turns().all().last().unwrap();
    assert_eq!(last.role, Role::System);
    assert!(last.content.starts_with("[PARTIAL RESPONSE DUE TO CANCELLATION]"));
    assert!(!agent.has_pending_world_state());
}

#[tokio::test]
async fn missing_worker_is_reported_not_answered() {
    let tmp = TempDir::new().unwrap();
    let mut config = setup(&tmp, "");
    config.generation.program = "/nonexistent/worldline-worker".into();
    config.generation.run_args = Vec::new();
    let mut agent = agent(config);

    let reply = agent.respond("anyone there?", &CancellationToken::new()).await;
    assert!(reply.text.is_empty());
    assert!(matches!(reply.errors[0], GenerationError::Spawn { .. }));

    let outcome = agent.wait_world_state().await.unwrap();
    assert_eq!(outcome.merged_facets, 0);

    let contents: Vec<&str> = agent.turns().all().iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents[0], "anyone there?");
    assert!(contents[1].starts_with("[ERROR] failed to start generation worker"));
    assert!(contents[2].starts_with("[ERROR PROCESSING RESPONSE]"));
    assert!(agent.world().lock().await.snapshot().is_empty());
}

#[tokio::test]
async fn cancelled_reply_keeps_partial_text() {
    let tmp = TempDir::new().unwrap();
    let marker = tmp.path().join("chat-started");
    let body = format!(
        r#"if [ "$3" = "--format" ]; then exit 0; fi
printf 'Let me think\n'
touch '{}'
exec sleep 30"#,
        marker.display()
    );
    let config = setup(&tmp, &body);
    let mut agent = agent(config);

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            wait_for(&marker).await;
            // Give the reader a moment to take the line off the pipe.
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });
    }
    let reply = tokio::time::timeout(Duration::from_secs(10), agent.respond("hmm?", &token))
        .await
        .unwrap();

    assert!(reply.interrupted);
    assert_eq!(reply.errors, vec![GenerationError::Cancelled]);
    assert_eq!(reply.text, "Let me think");
    agent.shutdown().await;
}
