//! Streaming generation against an external worker process.
//!
//! A [`GenerationRequest`] is handed to [`session::GenerationSession::run`], which spawns the
//! worker, feeds every output line through [`aggregator::aggregate`], and returns a
//! [`GenerationResult`] even when cancelled part-way. [`prompt`] builds the payloads.

pub mod aggregator;
pub mod prompt;
pub mod session;

use serde::Serialize;

use crate::error::GenerationError;
use crate::world_state::WorldState;
use prompt::PromptPayload;

/// How worker output lines are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Lines are concatenated into one reply.
    FreeText,
    /// Every line is a JSON object contributing world-state facets.
    Structured,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::FreeText => "free_text",
            Self::Structured => "structured",
        })
    }
}

/// Running result of a generation. The variant fixes the mode.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    Text(String),
    Facets(WorldState),
}

impl Aggregate {
    pub fn empty(mode: Mode) -> Self {
        match mode {
            Mode::FreeText => Self::Text(String::new()),
            Mode::Structured => Self::Facets(WorldState::new()),
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            Self::Text(_) => Mode::FreeText,
            Self::Facets(_) => Mode::Structured,
        }
    }

    /// True when no line contributed anything usable.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Facets(facets) => facets.is_empty(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Facets(_) => None,
        }
    }

    pub fn into_facets(self) -> Option<WorldState> {
        match self {
            Self::Facets(facets) => Some(facets),
            Self::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub payload: PromptPayload,
    pub mode: Mode,
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub aggregate: Aggregate,
    /// Every error seen, in the order it happened.
    pub errors: Vec<GenerationError>,
    /// Set when the stream was stopped before end-of-output.
    pub interrupted: bool,
}

impl GenerationResult {
    pub(crate) fn spawn_failed(mode: Mode, error: GenerationError) -> Self {
        Self {
            aggregate: Aggregate::empty(mode),
            errors: vec![error],
            interrupted: false,
        }
    }

    /// Nothing contributed and something went wrong: must not be merged or logged as output.
    pub fn is_failed_attempt(&self) -> bool {
        self.aggregate.is_empty() && !self.errors.is_empty()
    }

    /// Errors joined for a system-role log entry.
    pub fn error_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        let joined = self
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Some(joined)
    }
}
