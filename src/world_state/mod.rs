pub mod model;
pub mod schema;

/// Facet name to arbitrary JSON value.
pub type WorldState = serde_json::Map<String, serde_json::Value>;

pub use model::WorldStateModel;
pub use schema::FacetSchema;
