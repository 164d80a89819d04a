//! End-to-end indexing runs over an in-memory realm.

mod common;

use std::sync::Arc;

use common::{EchoRenderer, FakeEvaluator, MemoryReader, REALM, base_card, card_json, open_db, pet, pet_json, url};
use realm_index_core::index::{GetEntryOptions, IndexDb, InstanceOrError, SourceOrError};
use realm_index_core::runner::{CardEvaluator, EvaluatorError, IndexOperation, IndexRunner, Reader, TypesCache};
use serde_json::json;

struct Realm {
    db: Arc<IndexDb>,
    reader: Arc<MemoryReader>,
    evaluator: Arc<FakeEvaluator>,
    types: Arc<TypesCache>,
    runner: IndexRunner,
}

/// `Person/hassan.json` owns `Pet/mango.json` and `Pet/vangogh.json`.
fn realm() -> Realm {
    let (db, writer) = open_db();
    let reader = Arc::new(MemoryReader::default());
    reader.write("person.gts", "export class Person {}", 1);
    reader.write("pet.gts", "export class Pet {}", 1);
    reader.write("Person/hassan.json", card_json("../person", "Person", json!({ "name": "Hassan" })), 1);
    reader.write("Pet/mango.json", pet_json("Mango", "../Person/hassan"), 1);
    reader.write("Pet/vangogh.json", pet_json("Van Gogh", "../Person/hassan"), 1);

    let evaluator = Arc::new(FakeEvaluator::new());
    let types = Arc::new(TypesCache::new());
    let runner = IndexRunner::new(
        REALM,
        writer,
        Arc::clone(&reader) as Arc<dyn Reader>,
        Arc::clone(&evaluator) as Arc<dyn CardEvaluator>,
        Arc::new(EchoRenderer),
    )
    .unwrap()
    .with_types_cache(Arc::clone(&types));
    Realm { db, reader, evaluator, types, runner }
}

impl Realm {
    fn instance(&self, local: &str) -> Option<InstanceOrError> {
        self.db.get_instance(&url(local), GetEntryOptions::default()).unwrap()
    }

    fn take_builds(&self) -> Vec<String> {
        let mut builds = std::mem::take(&mut *self.evaluator.builds.lock().unwrap());
        builds.sort();
        builds
    }
}

#[tokio::test]
async fn from_scratch_indexes_every_file() {
    let realm = realm();
    let result = realm.runner.from_scratch().await.unwrap();

    assert_eq!(result.stats.instances_indexed, 3);
    assert_eq!(result.stats.modules_indexed, 2);
    assert_eq!(result.stats.instance_errors, 0);
    assert_eq!(result.stats.total_index_entries, 5);
    assert!(result.ignore_data.is_empty());

    let Some(InstanceOrError::Instance(mango)) = realm.instance("Pet/mango") else {
        panic!("expected Pet/mango to be indexed");
    };
    assert_eq!(mango.types, vec![pet().internal_key(), base_card().internal_key()]);
    assert_eq!(mango.display_names, vec!["Pet", "CardDef"]);
    let search_doc = mango.search_doc.unwrap();
    assert_eq!(search_doc["name"], "Mango");
    assert_eq!(search_doc["_cardType"], "Pet");
    assert!(mango.deps.contains(&url("pet")));
    assert!(mango.deps.contains(&url("Person/hassan")));
    assert_eq!(mango.instance["id"], url("Pet/mango"));
    assert_eq!(mango.instance["meta"]["lastModified"], 1);

    let embedded = mango.embedded_html.unwrap();
    assert_eq!(embedded[&pet().internal_key()], r#"<embedded as="Pet">Mango</embedded>"#);
    assert_eq!(embedded[&base_card().internal_key()], r#"<embedded as="CardDef">Mango</embedded>"#);
    assert_eq!(mango.atom_html.as_deref(), Some(r#"<atom as="Pet">Mango</atom>"#));

    assert!(matches!(
        realm.db.get_module(&url("pet"), GetEntryOptions::default()).unwrap(),
        Some(SourceOrError::Source(_))
    ));
}

#[tokio::test]
async fn from_scratch_only_visits_changed_files() {
    let realm = realm();
    realm.runner.from_scratch().await.unwrap();
    realm.take_builds();

    realm.reader.write("Pet/mango.json", pet_json("Mango II", "../Person/hassan"), 2);
    realm.reader.remove("Pet/vangogh.json");
    let result = realm.runner.from_scratch().await.unwrap();

    assert_eq!(realm.take_builds(), vec![url("Pet/mango")]);
    assert_eq!(result.stats.instances_indexed, 1);
    assert_eq!(result.stats.total_index_entries, 4);
    assert!(realm.instance("Pet/vangogh").is_none());
    let Some(InstanceOrError::Instance(mango)) = realm.instance("Pet/mango") else {
        panic!("expected Pet/mango to be indexed");
    };
    assert_eq!(mango.search_doc.unwrap()["name"], "Mango II");
    assert_eq!(mango.last_modified, Some(2));
}

#[tokio::test]
async fn incremental_update_revisits_dependents() {
    let realm = realm();
    realm.runner.from_scratch().await.unwrap();
    realm.take_builds();

    realm
        .reader
        .write("Person/hassan.json", card_json("../person", "Person", json!({ "name": "Hassan A." })), 2);
    let result = realm
        .runner
        .incremental(&[url("Person/hassan.json")], IndexOperation::Update)
        .await
        .unwrap();

    assert_eq!(
        result.invalidations,
        vec![url("Person/hassan.json"), url("Pet/mango.json"), url("Pet/vangogh.json")]
    );
    assert_eq!(
        realm.take_builds(),
        vec![url("Person/hassan"), url("Pet/mango"), url("Pet/vangogh")]
    );
    assert_eq!(result.stats.instances_indexed, 3);
    let Some(InstanceOrError::Instance(hassan)) = realm.instance("Person/hassan") else {
        panic!("expected Person/hassan to be indexed");
    };
    assert_eq!(hassan.search_doc.unwrap()["name"], "Hassan A.");
}

#[tokio::test]
async fn incremental_delete_tombstones_the_file_and_revisits_dependents() {
    let realm = realm();
    realm.runner.from_scratch().await.unwrap();
    realm.take_builds();

    realm.reader.remove("Person/hassan.json");
    let result = realm
        .runner
        .incremental(&[url("Person/hassan.json")], IndexOperation::Delete)
        .await
        .unwrap();

    assert_eq!(result.invalidations.len(), 3);
    assert_eq!(realm.take_builds(), vec![url("Pet/mango"), url("Pet/vangogh")]);
    assert!(realm.instance("Person/hassan").is_none());
    assert!(matches!(realm.instance("Pet/mango"), Some(InstanceOrError::Instance(_))));
    assert_eq!(result.stats.total_index_entries, 4);
}

#[tokio::test]
async fn incremental_update_of_a_missing_seed_fails() {
    let realm = realm();
    realm.runner.from_scratch().await.unwrap();

    let err = realm
        .runner
        .incremental(&[url("Pet/ghost.json")], IndexOperation::Update)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.to_string(), format!("missing file {}", url("Pet/ghost.json")));
}

#[tokio::test]
async fn failed_runs_do_not_block_later_runs() {
    let realm = realm();
    realm.runner.from_scratch().await.unwrap();

    let err = realm
        .runner
        .incremental(&[url("Pet/ghost.json")], IndexOperation::Update)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    realm
        .reader
        .write("Person/hassan.json", card_json("../person", "Person", json!({ "name": "Hassan A." })), 2);
    let result = realm
        .runner
        .incremental(&[url("Person/hassan.json")], IndexOperation::Update)
        .await
        .unwrap();
    assert_eq!(result.stats.instances_indexed, 3);
    let Some(InstanceOrError::Instance(hassan)) = realm.instance("Person/hassan") else {
        panic!("expected Person/hassan to be indexed");
    };
    assert_eq!(hassan.search_doc.unwrap()["name"], "Hassan A.");

    let result = realm.runner.from_scratch().await.unwrap();
    assert_eq!(result.stats.total_index_entries, 5);
    assert_eq!(
        realm.db.latest_version(REALM).unwrap(),
        realm.db.current_version(REALM).unwrap()
    );
}

#[tokio::test]
async fn files_of_other_realms_are_never_visited() {
    let realm = realm();
    let stray = "http://other-realm/test/Pet/stray.json";
    realm.reader.write_url(stray, pet_json("Stray", "../Person/hassan"), 1);

    let result = realm.runner.from_scratch().await.unwrap();
    assert_eq!(result.stats.instances_indexed, 3);
    assert_eq!(
        realm.take_builds(),
        vec![url("Person/hassan"), url("Pet/mango"), url("Pet/vangogh")]
    );
    assert!(realm.db.get_instance(stray, GetEntryOptions::work_in_progress()).unwrap().is_none());

    let result = realm.runner.incremental(&[stray.to_string()], IndexOperation::Update).await.unwrap();
    assert!(result.invalidations.is_empty());
    assert!(realm.take_builds().is_empty());
}

#[tokio::test]
async fn ignore_file_excludes_matching_paths() {
    let realm = realm();
    realm.reader.write(".gitignore", "Pet/vangogh.json\n", 1);
    let result = realm.runner.from_scratch().await.unwrap();

    assert_eq!(result.stats.instances_indexed, 2);
    assert!(realm.instance("Pet/vangogh").is_none());
    assert_eq!(result.ignore_data.get(REALM).map(String::as_str), Some("Pet/vangogh.json\n"));

    realm.take_builds();
    let result = realm
        .runner
        .incremental(&[url("Pet/vangogh.json")], IndexOperation::Update)
        .await
        .unwrap();
    assert!(realm.take_builds().is_empty());
    assert_eq!(result.stats.instances_indexed, 0);
}

#[tokio::test]
async fn module_errors_are_recorded_without_the_module_itself_as_a_dep() {
    let realm = realm();
    realm.evaluator.break_module(
        &url("pet.gts"),
        EvaluatorError::new("Unexpected token", 500).with_deps([url("pet.gts"), url("person")]),
    );
    let result = realm.runner.from_scratch().await.unwrap();

    assert_eq!(result.stats.module_errors, 1);
    assert_eq!(result.stats.modules_indexed, 1);
    let Some(SourceOrError::Error { error, .. }) =
        realm.db.get_module(&url("pet.gts"), GetEntryOptions::default()).unwrap()
    else {
        panic!("expected an error entry for pet.gts");
    };
    assert_eq!(
        error.message,
        format!("encountered error loading module \"{}\": Unexpected token", url("pet.gts"))
    );
    assert_eq!(error.deps, vec![url("person")]);
}

#[tokio::test]
async fn instance_errors_are_retried_once_their_deps_change() {
    let realm = realm();
    realm.evaluator.break_cards_of(&url("pet"));
    let result = realm.runner.from_scratch().await.unwrap();
    assert_eq!(result.stats.instance_errors, 2);
    assert_eq!(result.stats.instances_indexed, 1);

    let Some(InstanceOrError::Error(broken)) = realm.instance("Pet/mango") else {
        panic!("expected an error entry for Pet/mango");
    };
    assert_eq!(broken.error.message, format!("cannot build {}", url("Pet/mango")));
    assert!(broken.error.deps.contains(&url("pet")));

    realm.evaluator.fix_cards_of(&url("pet"));
    realm.take_builds();
    let result = realm.runner.incremental(&[url("pet.gts")], IndexOperation::Update).await.unwrap();

    assert!(result.invalidations.contains(&url("Pet/mango.json")));
    assert_eq!(realm.take_builds(), vec![url("Pet/mango"), url("Pet/vangogh")]);
    assert!(matches!(realm.instance("Pet/mango"), Some(InstanceOrError::Instance(_))));
    assert!(matches!(realm.instance("Pet/vangogh"), Some(InstanceOrError::Instance(_))));
}

#[tokio::test]
async fn from_scratch_always_retries_error_entries() {
    let realm = realm();
    realm.evaluator.break_cards_of(&url("pet"));
    realm.runner.from_scratch().await.unwrap();

    realm.evaluator.fix_cards_of(&url("pet"));
    realm.take_builds();
    let result = realm.runner.from_scratch().await.unwrap();

    assert_eq!(realm.take_builds(), vec![url("Pet/mango"), url("Pet/vangogh")]);
    assert_eq!(result.stats.instance_errors, 0);
    assert!(matches!(realm.instance("Pet/vangogh"), Some(InstanceOrError::Instance(_))));
}

#[tokio::test]
async fn types_cache_is_cleared_when_a_module_changes() {
    let realm = realm();
    realm.reader.write("util.gts", "export const x = 1;", 1);
    realm.runner.from_scratch().await.unwrap();
    assert_eq!(realm.types.len(), 2);

    realm
        .runner
        .incremental(&[url("Pet/mango.json")], IndexOperation::Update)
        .await
        .unwrap();
    assert_eq!(realm.types.len(), 2);

    let result = realm.runner.incremental(&[url("util.gts")], IndexOperation::Update).await.unwrap();
    assert_eq!(result.invalidations, vec![url("util.gts")]);
    assert!(realm.types.is_empty());
}
