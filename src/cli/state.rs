use std::sync::Arc;

use anyhow::Result;

use worldline::config::AgentConfig;
use worldline::db::Persistence;
use worldline::generation::prompt::render_value;
use worldline::world_state::{FacetSchema, WorldStateModel};

/// Print the last saved world state.
pub fn state(config: &AgentConfig) -> Result<()> {
    let schema = FacetSchema::resolve(&config.world_state.schema, &config.world_state.schemas)?;
    let store: Arc<dyn Persistence> = Arc::from(worldline::db::open_store(config)?);
    let model = WorldStateModel::load(schema, store);
    println!("{}", render(&model));
    Ok(())
}

/// Facets in schema order, then any unknown ones, then the schema facets still unset.
pub fn render(model: &WorldStateModel) -> String {
    let mut out = format!("World state (schema {})\n{}\n", model.schema().version(), "=".repeat(40));
    let facets = model.ordered_facets();
    if facets.is_empty() {
        out.push_str("  (empty)\n");
    }
    for (name, value) in facets {
        out.push_str(&format!("  {:<26} {}\n", name, render_value(value)));
    }
    let missing = model.missing_facets();
    if !missing.is_empty() && missing.len() < model.schema().facets().len() {
        out.push_str(&format!("\nNot yet filled: {}\n", missing.join(", ")));
    }
    if model.is_dirty() {
        out.push_str("\n(unsaved changes)\n");
    }
    out
}
