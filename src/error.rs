//! Error taxonomy for generation sessions and world-state persistence.
//!
//! Only [`GenerationError::Spawn`] and [`GenerationError::Io`] end a stream early.
//! Everything else is recorded on the [`GenerationResult`](crate::generation::GenerationResult)
//! and the stream keeps going.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// The worker process could not be started. Nothing was read.
    #[error("failed to start generation worker `{program}`: {message}")]
    Spawn { program: String, message: String },

    /// A line could not be turned into text.
    #[error("undecodable worker output line: {message}")]
    Decode { message: String },

    /// A structured-mode line was not a JSON object.
    #[error("JSON decoding error on line: {message} (line: {line})")]
    Parse { message: String, line: String },

    /// Generation was cut short by an external cancellation.
    #[error("Generation interrupted")]
    Cancelled,

    /// Reading the worker's output failed; the stream was abandoned.
    #[error("error reading worker output: {message}")]
    Io { message: String },

    /// The worker exited unsuccessfully after its output was consumed.
    #[error("generation worker exited with {status}")]
    WorkerExit { status: String },
}

impl GenerationError {
    /// Errors after which no further output was read.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Spawn { .. })
    }
}

/// A durable write failed. In-memory state has already been updated.
#[derive(Debug, Error)]
#[error("failed to persist {what}: {message}")]
pub struct PersistenceError {
    pub what: &'static str,
    pub message: String,
}

impl PersistenceError {
    pub fn new(what: &'static str, err: &anyhow::Error) -> Self {
        Self {
            what,
            message: format!("{err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_message_is_sentinel() {
        assert_eq!(GenerationError::Cancelled.to_string(), "Generation interrupted");
    }

    #[test]
    fn only_spawn_is_fatal() {
        let spawn = GenerationError::Spawn {
            program: "ollama".into(),
            message: "not found".into(),
        };
        assert!(spawn.is_fatal());
        assert!(!GenerationError::Cancelled.is_fatal());
        assert!(!GenerationError::Parse {
            message: "eof".into(),
            line: "{".into()
        }
        .is_fatal());
    }

    #[test]
    fn persistence_error_keeps_context_chain() {
        let err = anyhow::anyhow!("disk full").context("failed to write snapshot");
        let p = PersistenceError::new("world state", &err);
        assert_eq!(
            p.to_string(),
            "failed to persist world state: failed to write snapshot: disk full"
        );
    }
}
