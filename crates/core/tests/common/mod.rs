//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use realm_index_core::code_ref::CodeRef;
use realm_index_core::index::{IndexDb, IndexEntry, IndexWriter, InstanceEntry, SourceEntry};
use realm_index_core::runner::{
    BuiltCard, CardDefinition, CardEvaluator, CardResource, EvaluatorError, FieldDefinition,
    FieldKind, FileRef, ModuleSummary, Reader, ReaderError, RenderError, RenderFormat, Renderer,
};
use serde_json::{Value, json};

pub const REALM: &str = "http://test-realm/test/";
pub const BASE_MODULE: &str = "https://cardstack.com/base/card-api";
pub const STRING_MODULE: &str = "https://cardstack.com/base/string";
pub const NUMBER_MODULE: &str = "https://cardstack.com/base/number";

pub fn url(local: &str) -> String {
    format!("{REALM}{local}")
}

pub fn base_card() -> CodeRef {
    CodeRef::new(BASE_MODULE, "CardDef")
}

pub fn person() -> CodeRef {
    CodeRef::new(url("person"), "Person")
}

pub fn pet() -> CodeRef {
    CodeRef::new(url("pet"), "Pet")
}

pub fn address() -> CodeRef {
    CodeRef::new(url("address"), "Address")
}

fn string_field() -> CodeRef {
    CodeRef::new(STRING_MODULE, "default")
}

fn number_field() -> CodeRef {
    CodeRef::new(NUMBER_MODULE, "default")
}

pub fn open_db() -> (Arc<IndexDb>, IndexWriter) {
    let db = Arc::new(IndexDb::open_in_memory().unwrap());
    let writer = IndexWriter::new(Arc::clone(&db));
    (db, writer)
}

/// Instance entry whose type chain ends at the base card.
pub fn instance(card_type: &CodeRef, search_doc: Value, deps: &[&str]) -> IndexEntry {
    let mut types = vec![card_type.internal_key()];
    let mut display_names = vec![card_type.name.clone()];
    if card_type != &base_card() {
        types.push(base_card().internal_key());
        display_names.push("Card".to_string());
    }
    IndexEntry::Instance(InstanceEntry {
        resource: json!({ "type": "card", "attributes": search_doc.clone() }),
        source: search_doc.to_string(),
        search_doc,
        deps: deps.iter().map(|d| d.to_string()).collect(),
        types,
        display_names,
        embedded_html: Some(BTreeMap::from([(
            card_type.internal_key(),
            format!("<embedded>{}</embedded>", card_type.name),
        )])),
        atom_html: Some(format!("<atom>{}</atom>", card_type.name)),
        last_modified: 1,
        resource_created_at: 1,
        ..InstanceEntry::default()
    })
}

pub fn module(deps: &[&str]) -> IndexEntry {
    IndexEntry::Module(SourceEntry {
        source: "export class X {}".to_string(),
        deps: deps.iter().map(|d| d.to_string()).collect::<BTreeSet<_>>(),
        last_modified: 1,
        resource_created_at: 1,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Card evaluator
// ─────────────────────────────────────────────────────────────────────────────

pub struct FakeEvaluator {
    defs: HashMap<CodeRef, CardDefinition>,
    broken_modules: Mutex<HashMap<String, EvaluatorError>>,
    broken_cards: Mutex<HashSet<String>>,
    pub builds: Mutex<Vec<String>>,
    pub imports: Mutex<Vec<String>>,
}

impl FakeEvaluator {
    pub fn new() -> Self {
        let mut defs = HashMap::new();
        let mut add = |code_ref: CodeRef, super_ref: Option<CodeRef>, fields: &[(&str, FieldKind, CodeRef)]| {
            defs.insert(
                code_ref.clone(),
                CardDefinition {
                    display_name: code_ref.name.clone(),
                    code_ref,
                    super_ref,
                    fields: fields
                        .iter()
                        .map(|(name, kind, card)| (name.to_string(), FieldDefinition::new(*kind, card.clone())))
                        .collect(),
                },
            );
        };

        add(base_card(), None, &[("title", FieldKind::Contains, string_field())]);
        add(
            person(),
            Some(base_card()),
            &[
                ("name", FieldKind::Contains, string_field()),
                ("age", FieldKind::Contains, number_field()),
                ("nickNames", FieldKind::ContainsMany, string_field()),
                ("address", FieldKind::Contains, address()),
                ("friends", FieldKind::LinksToMany, person()),
                ("bestFriend", FieldKind::LinksTo, person()),
            ],
        );
        add(
            pet(),
            Some(base_card()),
            &[("name", FieldKind::Contains, string_field()), ("owner", FieldKind::LinksTo, person())],
        );
        add(
            address(),
            None,
            &[("city", FieldKind::Contains, string_field()), ("street", FieldKind::Contains, string_field())],
        );

        Self {
            defs,
            broken_modules: Mutex::new(HashMap::new()),
            broken_cards: Mutex::new(HashSet::new()),
            builds: Mutex::new(Vec::new()),
            imports: Mutex::new(Vec::new()),
        }
    }

    pub fn break_module(&self, url: &str, error: EvaluatorError) {
        self.broken_modules.lock().unwrap().insert(url.to_string(), error);
    }

    pub fn fix_module(&self, url: &str) {
        self.broken_modules.lock().unwrap().remove(url);
    }

    /// Fail building any instance that adopts from `module`.
    pub fn break_cards_of(&self, module: &str) {
        self.broken_cards.lock().unwrap().insert(module.to_string());
    }

    pub fn fix_cards_of(&self, module: &str) {
        self.broken_cards.lock().unwrap().remove(module);
    }

    pub fn build_count(&self) -> usize {
        self.builds.lock().unwrap().len()
    }
}

#[async_trait]
impl CardEvaluator for FakeEvaluator {
    async fn import_module(&self, url: &str) -> Result<ModuleSummary, EvaluatorError> {
        self.imports.lock().unwrap().push(url.to_string());
        if let Some(error) = self.broken_modules.lock().unwrap().get(url) {
            return Err(error.clone());
        }
        Ok(ModuleSummary { consumed_modules: vec![BASE_MODULE.to_string()], is_shimmed: false })
    }

    async fn load_definition(&self, code_ref: &CodeRef) -> Result<Option<CardDefinition>, EvaluatorError> {
        Ok(self.defs.get(code_ref).cloned())
    }

    async fn build_card(&self, resource: &CardResource, instance_url: &str) -> Result<BuiltCard, EvaluatorError> {
        self.builds.lock().unwrap().push(instance_url.to_string());
        let card_type = resource.meta.adopts_from.resolve(Some(instance_url));
        if self.broken_cards.lock().unwrap().contains(&card_type.module) {
            return Err(EvaluatorError::new(format!("cannot build {instance_url}"), 500)
                .with_deps([card_type.module.clone()]));
        }

        let mut deps = vec![card_type.module.clone()];
        if let Some(owner) = resource.relationships.pointer("/owner/links/self").and_then(Value::as_str) {
            deps.push(realm_index_core::paths::canonical_url(owner, Some(instance_url)));
        }
        Ok(BuiltCard {
            serialized: serde_json::to_value(resource).unwrap(),
            search_doc: resource.attributes.clone(),
            deps,
            card_type,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader and renderer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryReader {
    files: Mutex<BTreeMap<String, FileRef>>,
}

impl MemoryReader {
    pub fn write(&self, local: &str, content: impl Into<String>, last_modified: i64) {
        self.files.lock().unwrap().insert(
            url(local),
            FileRef { content: content.into(), last_modified, created: 1 },
        );
    }

    /// Serve a file under an absolute url, possibly outside the test realm.
    pub fn write_url(&self, url: &str, content: impl Into<String>, last_modified: i64) {
        self.files.lock().unwrap().insert(
            url.to_string(),
            FileRef { content: content.into(), last_modified, created: 1 },
        );
    }

    pub fn remove(&self, local: &str) {
        self.files.lock().unwrap().remove(&url(local));
    }
}

#[async_trait]
impl Reader for MemoryReader {
    async fn mtimes(&self) -> Result<BTreeMap<String, i64>, ReaderError> {
        Ok(self.files.lock().unwrap().iter().map(|(url, f)| (url.clone(), f.last_modified)).collect())
    }

    async fn read_file(&self, url: &str) -> Result<Option<FileRef>, ReaderError> {
        Ok(self.files.lock().unwrap().get(url).cloned())
    }
}

pub struct EchoRenderer;

#[async_trait]
impl Renderer for EchoRenderer {
    async fn render(
        &self,
        card: &BuiltCard,
        format: RenderFormat,
        as_type: Option<&CodeRef>,
    ) -> Result<String, RenderError> {
        let name = card.search_doc.get("name").and_then(Value::as_str).unwrap_or("");
        let as_type = as_type.map_or_else(|| card.card_type.name.clone(), |t| t.name.clone());
        Ok(format!("<{format} as=\"{as_type}\">{name}</{format}>"))
    }
}

/// Card document adopting from `module` (relative to the instance) / `name`.
pub fn card_json(module: &str, name: &str, attributes: Value) -> String {
    json!({
        "data": {
            "type": "card",
            "attributes": attributes,
            "meta": { "adoptsFrom": { "module": module, "name": name } }
        }
    })
    .to_string()
}

/// Card document with an `owner` link.
pub fn pet_json(name: &str, owner: &str) -> String {
    json!({
        "data": {
            "type": "card",
            "attributes": { "name": name },
            "relationships": { "owner": { "links": { "self": owner } } },
            "meta": { "adoptsFrom": { "module": "../pet", "name": "Pet" } }
        }
    })
    .to_string()
}
