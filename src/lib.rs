//! Terminal conversational agent that keeps an evolving world-state summary next to its
//! turn history.
//!
//! A locally run text-generation process (by default `ollama run <model>`) does the
//! reasoning. Every user message gets a free-text reply informed by semantically recalled
//! turns and the current world state, followed by a background structured generation that
//! refreshes the world state one facet per JSON line.
//!
//! # Architecture
//!
//! - **Generation**: a worker process per request, streamed line by line; partial output
//!   survives cancellation
//! - **World state**: named facets from a versioned schema, merged by whole-facet overwrite
//! - **Recall**: local ONNX Runtime embeddings (all-MiniLM-L6-v2, 384 dimensions) in a flat
//!   squared-L2 index persisted on every insert
//! - **Storage**: SQLite, JSONL files, or both mirrored
//!
//! # Modules
//!
//! - [`agent`]: Single-session orchestration: turn logging, recall, replies, background world state
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`db`]: Persistence backends behind the [`db::Persistence`] trait
//! - [`embedding`]: Text-to-vector embedding via ONNX Runtime
//! - [`error`]: Generation and persistence error types
//! - [`generation`]: Worker sessions, line aggregation, and prompt payloads
//! - [`memory`]: Turn records, the turn log, and the vector index
//! - [`world_state`]: Facet schemas and the world-state model

pub mod agent;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod memory;
pub mod world_state;
