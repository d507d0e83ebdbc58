use anyhow::Result;

use worldline::config::AgentConfig;
use worldline::memory::turns::TurnLog;

/// Print the last `limit` logged turns.
pub fn history(config: &AgentConfig, limit: usize) -> Result<()> {
    let store = worldline::db::open_store(config)?;
    let log = TurnLog::from_turns(store.load_turns()?);

    if log.is_empty() {
        println!("No turns logged yet.");
        return Ok(());
    }

    println!("Showing {} of {} turn(s)\n", log.recent(limit).len(), log.len());
    for turn in log.recent(limit) {
        println!("  {} [{}] {}", turn.created_at, turn.role, turn.content);
    }
    Ok(())
}
