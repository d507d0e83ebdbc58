//! Prompt payloads for the worker: `{"messages": [{"role", "content"}, ...]}`.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::memory::turns::RecalledTurn;
use crate::memory::types::{ConversationTurn, Role};
use crate::world_state::{FacetSchema, WorldState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&ConversationTurn> for PromptMessage {
    fn from(turn: &ConversationTurn) -> Self {
        Self::new(turn.role, turn.content.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptPayload {
    pub messages: Vec<PromptMessage>,
}

impl PromptPayload {
    /// The single command-line argument handed to the worker.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize prompt payload")
    }
}

/// Inputs for a conversational reply.
pub struct ChatPrompt<'a> {
    pub persona: &'a str,
    pub schema: &'a FacetSchema,
    pub state: &'a WorldState,
    pub recalled: &'a [RecalledTurn],
    /// Most recent turns, oldest first. Should not include `user_input` itself.
    pub history: &'a [ConversationTurn],
    pub user_input: &'a str,
}

/// System message (persona, current beliefs, recalled turns), then history, then the user.
pub fn chat_payload(prompt: &ChatPrompt<'_>) -> PromptPayload {
    let mut system = prompt.persona.trim().to_string();

    if let Some(gap) = prompt.state.get("KnowledgeGap") {
        system.push_str(&format!("\nRecently, you were curious about this: {}.", render_value(gap)));
    }
    if let Some(Value::Array(steps)) = prompt.state.get("TinyNextStepOptions") {
        for step in steps {
            system.push_str(&format!(
                "\nYou've thought recently about this being potentially a good idea: {}.",
                render_value(step)
            ));
        }
    }

    let context: Vec<String> = prompt
        .schema
        .ordered(prompt.state)
        .into_iter()
        .filter(|(name, _)| *name != "KnowledgeGap" && *name != "TinyNextStepOptions")
        .map(|(name, value)| format!("- {name}: {}", render_value(value)))
        .collect();
    if !context.is_empty() {
        system.push_str("\n\nYour current read of the situation:\n");
        system.push_str(&context.join("\n"));
    }

    if !prompt.recalled.is_empty() {
        system.push_str("\n\nEarlier moments that may be relevant:\n");
        let lines: Vec<String> = prompt
            .recalled
            .iter()
            .map(|r| format!("- [{}] {}", r.turn.role, r.turn.content))
            .collect();
        system.push_str(&lines.join("\n"));
    }

    let mut messages = Vec::with_capacity(prompt.history.len() + 2);
    messages.push(PromptMessage::new(Role::System, system));
    messages.extend(prompt.history.iter().map(PromptMessage::from));
    messages.push(PromptMessage::new(Role::User, prompt.user_input));
    PromptPayload { messages }
}

/// One system message with the schema instructions and previous state, then the history.
pub fn world_state_payload(
    schema: &FacetSchema,
    state: &WorldState,
    history: &[ConversationTurn],
) -> PromptPayload {
    let mut system = String::from(
        "You are a predictive AI. Given the previous state and the chat history, return JSONL: \
one JSON object per line, each with exactly one of the keys below, replacing any text in \
<brackets>. Fill in every key. Do not repeat the chat history, only this data structure.\n\n\
Example response:\n",
    );
    system.push_str(&schema.example_lines().join("\n"));

    if state.is_empty() {
        system.push_str("\n\nThere is no previous state yet.");
    } else {
        let previous: Vec<String> = schema
            .ordered(state)
            .into_iter()
            .map(|(name, value)| {
                let mut line = WorldState::new();
                line.insert(name.to_string(), value.clone());
                Value::Object(line).to_string()
            })
            .collect();
        system.push_str("\n\nPrevious state:\n");
        system.push_str(&previous.join("\n"));
    }

    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(PromptMessage::new(Role::System, system));
    messages.extend(history.iter().map(PromptMessage::from));
    PromptPayload { messages }
}

/// Human-readable form of a facet value: unwraps `{"newValue": ..}`, joins lists.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(render_value).collect::<Vec<_>>().join("; "),
        Value::Object(map) => match map.get("newValue") {
            Some(inner) if map.len() == 1 => render_value(inner),
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}
