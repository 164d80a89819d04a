//! Runners and query engines built from a loaded config file.

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{EchoRenderer, FakeEvaluator, REALM, card_json, pet_json, url};
use realm_index_core::code_ref::CodeRef;
use realm_index_core::config::{ConfigLoader, ResolvedConfig};
use realm_index_core::index::{GetEntryOptions, IndexDb, IndexWriter, InstanceOrError};
use realm_index_core::query::{Query, QueryEngine, QueryError, QueryOptions};
use realm_index_core::runner::{
    BuiltCard, IndexOperation, IndexRunner, RenderError, RenderFormat, Renderer, RunnerError,
};
use serde_json::json;
use tempfile::{TempDir, tempdir};

fn write_file(root: &Path, local: &str, content: &str) {
    let path = root.join(local);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// A realm directory plus a config pointing at it, with `extra` appended.
fn configured_realm(extra: &str) -> (TempDir, ResolvedConfig) {
    let dir = tempdir().unwrap();
    let root = dir.path().join("realm");
    write_file(&root, "person.gts", "export class Person {}");
    write_file(&root, "pet.gts", "export class Pet {}");
    write_file(&root, "Person/hassan.json", &card_json("../person", "Person", json!({ "name": "Hassan" })));
    write_file(&root, "Pet/mango.json", &pet_json("Mango", "../Person/hassan"));

    let config_path = dir.path().join("config.toml");
    fs::write(
        &config_path,
        format!(
            r#"
version = 1
database = "{}/index.db"

[[realms]]
url = "http://test-realm/test"
root = "{}"
{extra}
"#,
            dir.path().display(),
            root.display()
        ),
    )
    .unwrap();
    let config = ConfigLoader::load(Some(&config_path)).unwrap();
    (dir, config)
}

fn open(config: &ResolvedConfig) -> Arc<IndexDb> {
    Arc::new(IndexDb::open(&config.database).unwrap())
}

struct SlowRenderer;

#[async_trait]
impl Renderer for SlowRenderer {
    async fn render(
        &self,
        _card: &BuiltCard,
        format: RenderFormat,
        _as_type: Option<&CodeRef>,
    ) -> Result<String, RenderError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(format!("<{format}></{format}>"))
    }
}

#[tokio::test]
async fn runner_indexes_the_configured_root() {
    let (_dir, config) = configured_realm(
        r#"
[indexing]
invalidation_chunk_size = 1
"#,
    );
    let db = open(&config);
    let runner = IndexRunner::from_config(
        &config,
        "http://test-realm/test",
        Arc::clone(&db),
        Arc::new(FakeEvaluator::new()),
        Arc::new(EchoRenderer),
    )
    .unwrap();
    assert_eq!(runner.realm_url(), REALM);

    let result = runner.from_scratch().await.unwrap();
    assert_eq!(result.stats.instances_indexed, 2);
    assert_eq!(result.stats.modules_indexed, 2);
    assert!(matches!(
        db.get_instance(&url("Pet/mango"), GetEntryOptions::default()).unwrap(),
        Some(InstanceOrError::Instance(_))
    ));

    // one url per bulk statement still reaches the whole closure
    let result = runner.incremental(&[url("person.gts")], IndexOperation::Update).await.unwrap();
    assert_eq!(
        result.invalidations,
        vec![url("person.gts"), url("Person/hassan.json"), url("Pet/mango.json")]
    );
    assert_eq!(result.stats.instances_indexed, 2);
}

#[tokio::test]
async fn configured_render_timeout_turns_slow_renders_into_errors() {
    let (_dir, config) = configured_realm(
        r#"
[indexing]
render_timeout_ms = 20
"#,
    );
    let db = open(&config);
    let runner = IndexRunner::from_config(
        &config,
        REALM,
        Arc::clone(&db),
        Arc::new(FakeEvaluator::new()),
        Arc::new(SlowRenderer),
    )
    .unwrap();

    let result = runner.from_scratch().await.unwrap();
    assert_eq!(result.stats.instances_indexed, 0);
    assert_eq!(result.stats.instance_errors, 2);
    let Some(InstanceOrError::Error(entry)) =
        db.get_instance(&url("Person/hassan"), GetEntryOptions::default()).unwrap()
    else {
        panic!("expected an error entry for Person/hassan");
    };
    assert!(entry.error.message.contains("longer than 20ms"));
}

#[test]
fn writer_uses_the_configured_chunk_size() {
    let (_dir, config) = configured_realm(
        r#"
[indexing]
invalidation_chunk_size = 3
"#,
    );
    assert_eq!(IndexWriter::from_config(open(&config), &config.indexing).chunk_size(), 3);
}

#[test]
fn unconfigured_realm_is_rejected() {
    let (_dir, config) = configured_realm("");
    let result = IndexRunner::from_config(
        &config,
        "http://elsewhere/realm/",
        open(&config),
        Arc::new(FakeEvaluator::new()),
        Arc::new(EchoRenderer),
    );
    let Err(err) = result else {
        panic!("expected an unconfigured realm to be rejected");
    };
    assert!(matches!(err, RunnerError::UnknownRealm(_)));
    assert_eq!(err.to_string(), "realm http://elsewhere/realm/ is not configured");
}

#[tokio::test]
async fn query_engine_uses_the_configured_base_card() {
    let (_dir, config) = configured_realm(
        r#"
[query]
base_card_module = "http://test-realm/test/person"
base_card_name = "Person"
"#,
    );
    let db = open(&config);
    let evaluator = Arc::new(FakeEvaluator::new());
    IndexRunner::from_config(&config, REALM, Arc::clone(&db), evaluator.clone(), Arc::new(EchoRenderer))
        .unwrap()
        .from_scratch()
        .await
        .unwrap();

    let query = Query {
        filter: Some(serde_json::from_value(json!({ "eq": { "name": "Hassan" } })).unwrap()),
        ..Query::default()
    };

    let engine = QueryEngine::from_config(Arc::clone(&db), evaluator.clone(), &config.query);
    let results = engine.search(REALM, &query, &QueryOptions::default()).await.unwrap();
    assert_eq!(results.meta.page.total, 1);
    assert_eq!(results.cards[0]["attributes"]["name"], "Hassan");

    // the built-in base card has no `name` field
    let engine = QueryEngine::new(db, evaluator);
    let err = engine.search(REALM, &query, &QueryOptions::default()).await.unwrap_err();
    assert!(matches!(err, QueryError::UnknownField { .. }));
}
