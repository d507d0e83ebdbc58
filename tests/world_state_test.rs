mod helpers;

use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use worldline::agent::apply_world_state;
use worldline::db::Persistence;
use worldline::error::GenerationError;
use worldline::generation::prompt::world_state_payload;
use worldline::generation::{Aggregate, GenerationRequest, Mode};
use worldline::world_state::schema::{FacetSchemaDef, FacetSpec};
use worldline::world_state::{FacetSchema, WorldState, WorldStateModel};

fn obj(value: Value) -> WorldState {
    value.as_object().unwrap().clone()
}

#[test]
fn merge_sequence_overwrites_per_key() {
    let tmp = TempDir::new().unwrap();
    let store: Arc<dyn Persistence> = Arc::new(helpers::mirrored_store(tmp.path()));
    let mut model = WorldStateModel::new(FacetSchema::v8(), store.clone());

    model.merge(obj(json!({"A": 1}))).unwrap();
    model.merge(obj(json!({"A": 2, "B": 3}))).unwrap();

    assert_eq!(Value::Object(model.snapshot()), json!({"A": 2, "B": 3}));
    assert_eq!(
        Value::Object(store.load_last_world_state().unwrap().unwrap()),
        json!({"A": 2, "B": 3})
    );
}

#[test]
fn state_survives_restart_on_every_backend() {
    for backend in ["sqlite", "jsonl", "mirrored"] {
        let tmp = TempDir::new().unwrap();
        let mut config = helpers::test_config(tmp.path(), &tmp.path().join("unused.sh"));
        config.storage.backend = backend.into();

        {
            let mut model = WorldStateModel::load(FacetSchema::v8(), helpers::store_for(&config));
            model
                .merge(obj(json!({"KnowledgeGap": "how tides work"})))
                .unwrap();
        }

        let model = WorldStateModel::load(FacetSchema::v8(), helpers::store_for(&config));
        assert_eq!(
            model.get("KnowledgeGap"),
            Some(&json!("how tides work")),
            "backend {backend}"
        );
    }
}

#[test]
fn configured_schema_shadows_builtin() {
    let extra = vec![FacetSchemaDef {
        version: "compact".into(),
        facets: vec![
            FacetSpec {
                name: "Scene".into(),
                instruction: "where we are".into(),
                list: false,
            },
            FacetSpec {
                name: "NextSteps".into(),
                instruction: "small moves".into(),
                list: true,
            },
        ],
    }];
    let schema = FacetSchema::resolve("compact", &extra).unwrap();
    let payload = world_state_payload(&schema, &WorldState::new(), &[]);
    let system = &payload.messages[0].content;

    assert!(system.contains(r#"{"Scene":{"newValue":"<where we are>"}}"#));
    assert!(system.contains(r#"{"NextSteps":["<small moves>","<small moves>"]}"#));
    assert!(!system.contains("GeneralContextState"));
}

#[cfg(unix)]
#[tokio::test]
async fn streamed_facets_with_bad_line_are_merged() {
    let tmp = TempDir::new().unwrap();
    let worker = helpers::write_worker(
        tmp.path(),
        "worker.sh",
        r#"printf '%s\n' '{"CurrentState":{"newValue":"x"}}' '{bad json'"#,
    );
    let store: Arc<dyn Persistence> = Arc::new(helpers::mirrored_store(tmp.path()));
    let mut model = WorldStateModel::new(FacetSchema::v8(), store.clone());

    let request = GenerationRequest {
        payload: world_state_payload(model.schema(), &model.snapshot(), &[]),
        mode: Mode::Structured,
    };
    let result = helpers::worker_session(&worker)
        .run(&request, || false, &CancellationToken::new())
        .await;

    assert_eq!(
        result.aggregate,
        Aggregate::Facets(obj(json!({"CurrentState": {"newValue": "x"}})))
    );
    assert_eq!(result.errors.len(), 1);
    match &result.errors[0] {
        GenerationError::Parse { line, .. } => assert_eq!(line, "{bad json"),
        other => panic!("expected a parse error, got {other:?}"),
    }

    let outcome = apply_world_state(&mut model, result);
    assert_eq!(outcome.merged_facets, 1);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(model.get("CurrentState"), Some(&json!({"newValue": "x"})));
    assert!(store.load_last_world_state().unwrap().unwrap().contains_key("CurrentState"));
}
