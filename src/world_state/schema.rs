//! Versioned, data-driven facet schemas.
//!
//! The facet set is never hardcoded in the merge path: a [`FacetSchema`] is resolved at
//! startup from the built-ins plus any `[[world_state.schemas]]` entries in the config.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::WorldState;

/// One named facet and the instruction the model is given for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetSpec {
    pub name: String,
    pub instruction: String,
    /// Facet holds a list of options instead of a `{"newValue": ...}` object.
    #[serde(default)]
    pub list: bool,
}

/// Config-file shape of a schema definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetSchemaDef {
    pub version: String,
    pub facets: Vec<FacetSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetSchema {
    version: String,
    facets: Vec<FacetSpec>,
}

impl FacetSchema {
    pub fn new(version: impl Into<String>, facets: Vec<FacetSpec>) -> Result<Self> {
        let version = version.into();
        if facets.is_empty() {
            bail!("facet schema {version} has no facets");
        }
        for (i, facet) in facets.iter().enumerate() {
            if facets[..i].iter().any(|f| f.name == facet.name) {
                bail!("facet schema {version} declares {} twice", facet.name);
            }
        }
        Ok(Self { version, facets })
    }

    /// Pick `version` out of the built-ins and `extra`. Extra definitions shadow built-ins.
    pub fn resolve(version: &str, extra: &[FacetSchemaDef]) -> Result<Self> {
        if let Some(def) = extra.iter().rev().find(|d| d.version == version) {
            return Self::new(def.version.clone(), def.facets.clone());
        }
        match version {
            "v8" => Ok(Self::v8()),
            "v7" => Ok(Self::v7()),
            other => {
                let mut known: Vec<&str> = vec!["v8", "v7"];
                known.extend(extra.iter().map(|d| d.version.as_str()));
                bail!("unknown facet schema: {other}. Known: {}", known.join(", "))
            }
        }
    }

    /// Eight facets, including a slow-moving general context.
    pub fn v8() -> Self {
        let mut facets = vec![facet(
            "GeneralContextState",
            "the general context of the chat we're having; current events; changes slowly, like an act in a play",
        )];
        facets.extend(Self::v7().facets);
        Self {
            version: "v8".into(),
            facets,
        }
    }

    /// Seven facets, without the general context.
    pub fn v7() -> Self {
        Self {
            version: "v7".into(),
            facets: vec![
                facet("CurrentState", "the current world state of the specific scene we're in"),
                facet("AbsoluteIdealWorld", "what you think the better world would be"),
                facet("IncrementallyBetterWorld", "a world on the way from the current one to the better one"),
                facet("AbsoluteAnxietyWorld", "the worst version of the current world"),
                facet("IncrementallyWorseWorld", "a step from the current world towards the absolute anxious world"),
                FacetSpec {
                    name: "TinyNextStepOptions".into(),
                    instruction: "tiny next steps towards the incrementally better world and/or away from the worse one".into(),
                    list: true,
                },
                facet("KnowledgeGap", "an area you want more information on"),
            ],
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn facets(&self) -> &[FacetSpec] {
        &self.facets
    }

    pub fn contains(&self, name: &str) -> bool {
        self.facets.iter().any(|f| f.name == name)
    }

    /// Schema facets present in `state` in schema order, then unknown facets by name.
    pub fn ordered<'a>(&'a self, state: &'a WorldState) -> Vec<(&'a str, &'a Value)> {
        let mut out: Vec<(&str, &Value)> = self
            .facets
            .iter()
            .filter_map(|f| state.get(&f.name).map(|v| (f.name.as_str(), v)))
            .collect();
        out.extend(
            state
                .iter()
                .filter(|(k, _)| !self.contains(k))
                .map(|(k, v)| (k.as_str(), v)),
        );
        out
    }

    /// Schema facets with no value in `state`.
    pub fn missing<'a>(&'a self, state: &WorldState) -> Vec<&'a str> {
        self.facets
            .iter()
            .filter(|f| !state.contains_key(&f.name))
            .map(|f| f.name.as_str())
            .collect()
    }

    /// One example JSONL line per facet, used to instruct the model.
    pub fn example_lines(&self) -> Vec<String> {
        self.facets
            .iter()
            .map(|f| {
                let placeholder = format!("<{}>", f.instruction);
                let value = if f.list {
                    Value::Array(vec![Value::String(placeholder.clone()), Value::String(placeholder)])
                } else {
                    serde_json::json!({ "newValue": placeholder })
                };
                let mut line = WorldState::new();
                line.insert(f.name.clone(), value);
                Value::Object(line).to_string()
            })
            .collect()
    }
}

fn facet(name: &str, instruction: &str) -> FacetSpec {
    FacetSpec {
        name: name.into(),
        instruction: instruction.into(),
        list: false,
    }
}
