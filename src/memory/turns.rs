//! In-memory turn history with lookup by embedding reference.

use std::collections::HashMap;

use super::index::Neighbor;
use super::types::ConversationTurn;

/// A turn found by similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct RecalledTurn {
    pub turn: ConversationTurn,
    pub distance: f32,
}

/// Append-only log of every turn this agent has recorded, oldest first.
#[derive(Debug, Default)]
pub struct TurnLog {
    turns: Vec<ConversationTurn>,
    by_ref: HashMap<usize, usize>,
}

impl TurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted turns. A later turn claiming an already seen
    /// embedding reference does not replace the first.
    pub fn from_turns(turns: Vec<ConversationTurn>) -> Self {
        let mut log = Self::new();
        for turn in turns {
            log.push(turn);
        }
        log
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        if let Some(r) = turn.embedding_ref() {
            if self.by_ref.contains_key(&r) {
                tracing::warn!(embedding_ref = r, turn = %turn.id, "embedding reference already taken");
            } else {
                self.by_ref.insert(r, self.turns.len());
            }
        }
        self.turns.push(turn);
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn all(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// The last `n` turns in chronological order.
    pub fn recent(&self, n: usize) -> &[ConversationTurn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    pub fn by_embedding_ref(&self, index: usize) -> Option<&ConversationTurn> {
        self.by_ref.get(&index).map(|&pos| &self.turns[pos])
    }

    /// Resolve search hits to turns, keeping hit order. Hits with no matching turn
    /// (an index row whose turn never got persisted) are dropped, as are hits past
    /// `max_distance`.
    pub fn recall(&self, hits: &[Neighbor], max_distance: Option<f32>) -> Vec<RecalledTurn> {
        hits.iter()
            .filter(|h| max_distance.map_or(true, |max| h.distance <= max))
            .filter_map(|h| {
                self.by_embedding_ref(h.index).map(|turn| RecalledTurn {
                    turn: turn.clone(),
                    distance: h.distance,
                })
            })
            .collect()
    }
}
