//! Conversation turn records.
//!
//! A [`ConversationTurn`] never owns its embedding: `embedding_ref` is a row number in the
//! [`MemoryIndex`](crate::memory::index::MemoryIndex), resolved by explicit lookup.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Who said it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

/// One logged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// UUID v7 (time-sortable).
    pub id: String,
    pub role: Role,
    pub content: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    #[serde(default)]
    embedding_ref: Option<usize>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            role,
            content: content.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
            embedding_ref: None,
        }
    }

    /// Rebuild a turn read back from storage.
    pub fn restore(
        id: String,
        role: Role,
        content: String,
        created_at: String,
        embedding_ref: Option<usize>,
    ) -> Self {
        Self {
            id,
            role,
            content,
            created_at,
            embedding_ref,
        }
    }

    pub fn embedding_ref(&self) -> Option<usize> {
        self.embedding_ref
    }

    /// Link this turn to its index row. Allowed exactly once.
    pub fn assign_embedding_ref(&mut self, index: usize) -> Result<()> {
        if let Some(existing) = self.embedding_ref {
            bail!(
                "turn {} already has embedding ref {existing}, refusing {index}",
                self.id
            );
        }
        self.embedding_ref = Some(index);
        Ok(())
    }
}
