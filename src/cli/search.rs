use anyhow::Result;
use std::sync::Arc;

use worldline::config::AgentConfig;
use worldline::memory::index::{MemoryIndex, Query};
use worldline::memory::turns::TurnLog;

/// Run a similarity search over logged turns from the terminal.
pub async fn search(config: &AgentConfig, query: &str, k: usize) -> Result<()> {
    let store = worldline::db::open_store(config)?;
    let log = TurnLog::from_turns(store.load_turns()?);

    let provider: Arc<dyn worldline::embedding::EmbeddingProvider> =
        Arc::from(worldline::embedding::create_provider(&config.embedding)?);
    let index = Arc::new(MemoryIndex::open(config.index_path(), provider)?);

    let query_text = query.to_string();
    let idx = Arc::clone(&index);
    let hits = tokio::task::spawn_blocking(move || idx.search(Query::Text(&query_text), k)).await??;
    let recalled = log.recall(&hits, config.retrieval.max_recall_distance);

    if recalled.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("Found {} result(s) among {} indexed turn(s)\n", recalled.len(), index.len()?);
    for (i, r) in recalled.iter().enumerate() {
        let preview: String = if r.turn.content.chars().count() > 120 {
            format!("{}...", r.turn.content.chars().take(120).collect::<String>())
        } else {
            r.turn.content.clone()
        };
        println!(
            "  {}. [{}] {} (distance: {:.4})",
            i + 1,
            r.turn.role,
            r.turn.created_at,
            r.distance
        );
        println!("     {preview}");
        println!();
    }

    Ok(())
}
