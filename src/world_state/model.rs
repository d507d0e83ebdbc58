//! The latest world-state snapshot and its merge protocol.
//!
//! [`WorldStateModel::merge`] overwrites whole facets (never merging inside one), then
//! persists the new snapshot. A failed persist leaves the in-memory state updated and the
//! model dirty; the in-memory copy is authoritative until the next successful write.

use std::sync::Arc;

use serde_json::Value;

use super::{FacetSchema, WorldState};
use crate::db::Persistence;
use crate::error::PersistenceError;

pub struct WorldStateModel {
    last_state: WorldState,
    schema: FacetSchema,
    store: Arc<dyn Persistence>,
    dirty: bool,
}

impl WorldStateModel {
    pub fn new(schema: FacetSchema, store: Arc<dyn Persistence>) -> Self {
        Self {
            last_state: WorldState::new(),
            schema,
            store,
            dirty: false,
        }
    }

    /// Restore the last persisted snapshot. A missing or unreadable snapshot starts empty.
    pub fn load(schema: FacetSchema, store: Arc<dyn Persistence>) -> Self {
        let mut model = Self::new(schema, store);
        match model.store.load_last_world_state() {
            Ok(Some(state)) => {
                tracing::info!(facets = state.len(), "world state loaded");
                model.last_state = state;
            }
            Ok(None) => tracing::info!("no saved world state, starting empty"),
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "error loading world state, starting empty");
            }
        }
        model
    }

    /// Overwrite each facet in `new_state`, then persist the result.
    pub fn merge(&mut self, new_state: WorldState) -> Result<(), PersistenceError> {
        let keys: Vec<String> = new_state.keys().cloned().collect();
        for (facet, value) in new_state {
            if !self.schema.contains(&facet) {
                tracing::debug!(facet = %facet, schema = self.schema.version(), "facet not in schema, keeping as-is");
            }
            self.last_state.insert(facet, value);
        }
        self.dirty = true;
        tracing::debug!(?keys, "world state merged");
        self.persist()
    }

    /// Re-attempt a failed persist. No-op when clean.
    pub fn retry_persist(&mut self) -> Result<(), PersistenceError> {
        if !self.dirty {
            return Ok(());
        }
        self.persist()
    }

    fn persist(&mut self) -> Result<(), PersistenceError> {
        match self
            .store
            .save_world_state_snapshot(&self.last_state, self.schema.version())
        {
            Ok(()) => {
                self.dirty = false;
                tracing::info!(facets = self.last_state.len(), "world state saved");
                Ok(())
            }
            Err(e) => {
                let err = PersistenceError::new("world state", &e);
                tracing::warn!(error = %err, "world state kept in memory only");
                Err(err)
            }
        }
    }

    /// A copy of the current state for prompt construction.
    pub fn snapshot(&self) -> WorldState {
        self.last_state.clone()
    }

    pub fn get(&self, facet: &str) -> Option<&Value> {
        self.last_state.get(facet)
    }

    pub fn schema(&self) -> &FacetSchema {
        &self.schema
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn ordered_facets(&self) -> Vec<(&str, &Value)> {
        self.schema.ordered(&self.last_state)
    }

    pub fn missing_facets(&self) -> Vec<&str> {
        self.schema.missing(&self.last_state)
    }
}
