//! Indexing orchestrator.
//!
//! A run discovers what changed, opens a batch, visits every invalidated url
//! and commits. Content failures become `error` rows; only storage and reader
//! failures (and a missing seed) abort a run.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::OnceCell;

use super::collaborators::{
    BuiltCard, CardDocument, CardEvaluator, CardResource, FileRef, Reader, ReaderError,
    RenderError, RenderFormat, Renderer,
};
use super::fs_reader::FsReader;
use super::ignore_rules::{IGNORE_FILE, IgnoreRules};
use super::types_cache::{TypeChain, TypesCache};
use crate::code_ref::CodeRef;
use crate::config::{IndexingConfig, ResolvedConfig};
use crate::index::{
    Batch, EntryType, ErrorEntry, IndexDb, IndexEntry, IndexError, IndexWriter, InstanceEntry,
    ModifiedTimes, SerializedError, SourceEntry,
};
use crate::paths::{
    RealmPaths, canonical_url, ensure_json_suffix, has_executable_extension, is_indexable, is_json,
};
use crate::query::fields::CARD_TYPE_FIELD;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error("missing file {url}")]
    NotFound { url: String },

    #[error("Batch is missing")]
    MissingBatch,

    #[error("invalid realm url {0}")]
    InvalidRealm(String),

    #[error("realm {0} is not configured")]
    UnknownRealm(String),
}

impl RunnerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// What an incremental run does with its seed urls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOperation {
    Update,
    /// Seeds stay tombstoned; only their dependents are revisited.
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub instances_indexed: u64,
    pub modules_indexed: u64,
    pub instance_errors: u64,
    pub module_errors: u64,
    pub total_index_entries: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromScratchResult {
    /// Directory url to `.gitignore` contents, for seeding the next run.
    pub ignore_data: BTreeMap<String, String>,
    pub stats: Stats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalResult {
    pub invalidations: Vec<String>,
    pub ignore_data: BTreeMap<String, String>,
    pub stats: Stats,
}

/// Indexes one realm.
///
/// A runner may be reused for several runs; each run opens its own batch and
/// starts with fresh statistics.
pub struct IndexRunner {
    realm: RealmPaths,
    writer: IndexWriter,
    reader: Arc<dyn Reader>,
    evaluator: Arc<dyn CardEvaluator>,
    renderer: Arc<dyn Renderer>,
    types: Arc<TypesCache>,
    render_timeout: Duration,
    ignore: Mutex<IgnoreRules>,
    batch: Mutex<Option<Batch>>,
    /// Instance visits of the current run, keyed by `.json` url.
    in_flight: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
    stats: Mutex<Stats>,
}

impl IndexRunner {
    pub fn new(
        realm_url: &str,
        writer: IndexWriter,
        reader: Arc<dyn Reader>,
        evaluator: Arc<dyn CardEvaluator>,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self, RunnerError> {
        let realm = RealmPaths::new(realm_url)
            .map_err(|e| RunnerError::InvalidRealm(format!("{realm_url}: {e}")))?;
        Ok(Self {
            ignore: Mutex::new(IgnoreRules::new(realm.clone())),
            realm,
            writer,
            reader,
            evaluator,
            renderer,
            types: Arc::new(TypesCache::new()),
            render_timeout: IndexingConfig::default().render_timeout(),
            batch: Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
            stats: Mutex::new(Stats::default()),
        })
    }

    /// Runner for a configured realm, reading files from its root directory
    /// and using the configured render timeout and invalidation chunk size.
    pub fn from_config(
        config: &ResolvedConfig,
        realm_url: &str,
        db: Arc<IndexDb>,
        evaluator: Arc<dyn CardEvaluator>,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self, RunnerError> {
        let realm = config
            .realm(realm_url)
            .ok_or_else(|| RunnerError::UnknownRealm(realm_url.to_string()))?;
        let reader = FsReader::new(&realm.root, &realm.url)?;
        let writer = IndexWriter::from_config(db, &config.indexing);
        tracing::debug!(
            realm = %realm.url,
            root = %realm.root.display(),
            render_timeout_ms = config.indexing.render_timeout_ms,
            "configured index runner"
        );
        Ok(Self::new(&realm.url, writer, Arc::new(reader), evaluator, renderer)?
            .with_render_timeout(config.indexing.render_timeout()))
    }

    /// Share a types cache between runners of one process.
    pub fn with_types_cache(mut self, types: Arc<TypesCache>) -> Self {
        self.types = types;
        self
    }

    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    /// Ignore rules returned by an earlier run.
    pub fn with_ignore_data(self, data: BTreeMap<String, String>) -> Self {
        *lock(&self.ignore) = IgnoreRules::from_data(self.realm.clone(), data);
        self
    }

    pub fn realm_url(&self) -> &str {
        self.realm.url()
    }

    /// Reindex every file whose modification time no longer matches the index.
    pub async fn from_scratch(&self) -> Result<FromScratchResult, RunnerError> {
        let start = Instant::now();
        tracing::debug!(realm = self.realm.url(), "starting from scratch indexing");
        self.open_batch()?;

        let index_mtimes = self.with_batch(|batch| batch.get_modified_times())?;
        let invalidations = sort_invalidations(self.discover_invalidations(&index_mtimes).await?);
        tracing::debug!(
            realm = self.realm.url(),
            count = invalidations.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "discovered invalidations"
        );

        for url in &invalidations {
            self.try_to_visit(url).await?;
        }

        let stats = self.finish()?;
        tracing::debug!(
            realm = self.realm.url(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "completed from scratch indexing"
        );
        Ok(FromScratchResult { ignore_data: lock(&self.ignore).data().clone(), stats })
    }

    /// Reindex `urls` and everything that depends on them.
    pub async fn incremental(
        &self,
        urls: &[String],
        operation: IndexOperation,
    ) -> Result<IncrementalResult, RunnerError> {
        let start = Instant::now();
        tracing::debug!(realm = self.realm.url(), ?urls, ?operation, "starting incremental indexing");
        self.open_batch()?;

        let invalidated = self.with_batch(|batch| batch.invalidate(urls))?;
        let invalidations = sort_invalidations(invalidated);
        if invalidations.iter().any(|url| has_executable_extension(url)) {
            self.types.clear();
        }

        let seeds: BTreeSet<String> = urls.iter().map(|u| canonical_url(u, None)).collect();
        for url in &invalidations {
            let is_seed = seeds.contains(url);
            match operation {
                IndexOperation::Delete if is_seed => {}
                _ if is_seed => self.visit(url).await?,
                _ => self.try_to_visit(url).await?,
            }
        }

        let stats = self.finish()?;
        tracing::debug!(
            realm = self.realm.url(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "completed incremental indexing"
        );
        Ok(IncrementalResult {
            invalidations,
            ignore_data: lock(&self.ignore).data().clone(),
            stats,
        })
    }

    fn open_batch(&self) -> Result<(), RunnerError> {
        let batch = self.writer.create_batch(self.realm.url())?;
        *lock(&self.batch) = Some(batch);
        lock(&self.in_flight).clear();
        *lock(&self.stats) = Stats::default();
        Ok(())
    }

    fn with_batch<T>(
        &self,
        f: impl FnOnce(&mut Batch) -> Result<T, IndexError>,
    ) -> Result<T, RunnerError> {
        let mut guard = lock(&self.batch);
        let batch = guard.as_mut().ok_or(RunnerError::MissingBatch)?;
        Ok(f(batch)?)
    }

    fn finish(&self) -> Result<Stats, RunnerError> {
        let batch = lock(&self.batch).take().ok_or(RunnerError::MissingBatch)?;
        let done = batch.done()?;
        let mut stats = lock(&self.stats);
        stats.total_index_entries = done.total_index_entries;
        Ok(stats.clone())
    }

    fn bump(&self, f: impl FnOnce(&mut Stats)) {
        f(&mut lock(&self.stats));
    }

    async fn discover_invalidations(
        &self,
        index_mtimes: &ModifiedTimes,
    ) -> Result<Vec<String>, RunnerError> {
        let fs_mtimes = self.reader.mtimes().await?;
        self.load_ignore_rules(&fs_mtimes).await?;

        let mut invalidations = Vec::new();
        let mut skipped = 0usize;
        {
            let ignore = lock(&self.ignore);
            for (url, last_modified) in &fs_mtimes {
                if !is_indexable(url) || ignore.is_ignored(url) {
                    continue;
                }
                let changed = match index_mtimes.get(url) {
                    None => true,
                    Some(entry) => {
                        entry.entry_type == EntryType::Error
                            || entry.last_modified != Some(*last_modified)
                    }
                };
                if changed {
                    invalidations.push(url.clone());
                } else {
                    skipped += 1;
                }
            }
        }

        if skipped == 0 {
            // Nothing is up to date: every eligible file gets visited.
            self.with_batch(|batch| batch.make_new_generation())?;
            return Ok(invalidations);
        }

        let deleted: Vec<String> =
            index_mtimes.keys().filter(|url| !fs_mtimes.contains_key(*url)).cloned().collect();
        if !deleted.is_empty() {
            tracing::debug!(count = deleted.len(), "found deleted files");
            invalidations.extend(deleted);
        }

        self.with_batch(|batch| batch.invalidate(&invalidations))?;
        self.with_batch(|batch| Ok(batch.invalidations().to_vec()))
    }

    /// Fetch each directory's ignore file the first time it is seen.
    async fn load_ignore_rules(&self, fs_mtimes: &BTreeMap<String, i64>) -> Result<(), RunnerError> {
        let ignore_files: Vec<&String> = fs_mtimes
            .keys()
            .filter(|url| url.rsplit('/').next() == Some(IGNORE_FILE))
            .collect();
        for url in ignore_files {
            let dir_url = &url[..url.len() - IGNORE_FILE.len()];
            if lock(&self.ignore).has(dir_url) {
                continue;
            }
            if let Some(file) = self.reader.read_file(url).await?
                && !file.content.is_empty()
            {
                lock(&self.ignore).add(dir_url, &file.content);
            }
        }
        Ok(())
    }

    /// Visit a derived invalidation; a file that no longer exists stays tombstoned.
    async fn try_to_visit(&self, url: &str) -> Result<(), RunnerError> {
        match self.visit(url).await {
            Err(e) if e.is_not_found() => {
                tracing::info!(%url, "tried to visit file, but it no longer exists");
                Ok(())
            }
            other => other,
        }
    }

    async fn visit(&self, url: &str) -> Result<(), RunnerError> {
        if lock(&self.ignore).is_ignored(url) {
            return Ok(());
        }
        if self.realm.local(url).is_none() {
            tracing::info!(
                %url,
                realm = self.realm.url(),
                "skipping visit of a url in a different realm"
            );
            return Ok(());
        }
        if !is_indexable(url) {
            return Ok(());
        }

        let start = Instant::now();
        let file = self
            .reader
            .read_file(url)
            .await?
            .ok_or_else(|| RunnerError::NotFound { url: url.to_string() })?;

        if has_executable_extension(url) {
            self.index_module(url, &file).await?;
        } else if is_json(url) {
            match serde_json::from_str::<CardDocument>(&file.content) {
                Ok(doc) if doc.data.is_card() => self.index_card(url, &file, doc.data).await?,
                Ok(_) => tracing::debug!(%url, "not a card resource"),
                Err(e) => tracing::warn!(%url, error = %e, "unable to parse as card JSON"),
            }
        }
        tracing::debug!(%url, elapsed_ms = start.elapsed().as_millis() as u64, "visited file");
        Ok(())
    }

    async fn index_module(&self, url: &str, file: &FileRef) -> Result<(), RunnerError> {
        let summary = match self.evaluator.import_module(url).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(%url, error = %e, "encountered error loading module");
                let mut error = SerializedError::new(
                    format!("encountered error loading module \"{url}\": {}", e.message),
                    e.status,
                );
                error.add_deps(e.deps.into_iter().filter(|dep| dep != url));
                let entry = ErrorEntry {
                    last_modified: Some(file.last_modified),
                    resource_created_at: Some(file.created),
                    ..ErrorEntry::new(error)
                };
                self.with_batch(|batch| batch.update_entry(url, &IndexEntry::Error(entry)))?;
                self.bump(|s| s.module_errors += 1);
                return Ok(());
            }
        };

        if summary.is_shimmed {
            tracing::debug!(%url, "module is shimmed, skipping");
            return Ok(());
        }

        let entry = SourceEntry {
            source: file.content.clone(),
            deps: summary.consumed_modules.into_iter().filter(|dep| dep != url).collect(),
            last_modified: file.last_modified,
            resource_created_at: file.created,
        };
        self.with_batch(|batch| batch.update_entry(url, &IndexEntry::Module(entry)))?;
        self.bump(|s| s.modules_indexed += 1);
        Ok(())
    }

    /// Index an instance at most once per run; a concurrent visit of the
    /// same url waits for the first.
    async fn index_card(
        &self,
        url: &str,
        file: &FileRef,
        resource: CardResource,
    ) -> Result<(), RunnerError> {
        let file_url = ensure_json_suffix(url);
        let cell = {
            let mut in_flight = lock(&self.in_flight);
            Arc::clone(in_flight.entry(file_url.clone()).or_default())
        };
        cell.get_or_try_init(|| self.build_instance(&file_url, file, resource)).await?;
        Ok(())
    }

    async fn build_instance(
        &self,
        file_url: &str,
        file: &FileRef,
        resource: CardResource,
    ) -> Result<(), RunnerError> {
        let instance_url = file_url.strip_suffix(".json").unwrap_or(file_url).to_string();
        let mut deps: BTreeSet<String> = resource
            .adopts_from_refs(file_url)
            .into_iter()
            .map(|code_ref| code_ref.module)
            .collect();

        let built = match self.evaluator.build_card(&resource, &instance_url).await {
            Ok(built) => built,
            Err(e) => {
                let partial = Partial { deps, ..Partial::default() };
                return self.record_instance_error(file_url, file, e.into(), partial);
            }
        };
        deps.extend(built.deps.iter().cloned());

        let chain = match self.types.get_types(self.evaluator.as_ref(), &built.card_type).await {
            Ok(chain) => chain,
            Err(error) => {
                let partial = Partial {
                    deps,
                    search_doc: Some(search_doc_with_card_type(&built, None)),
                    ..Partial::default()
                };
                return self.record_instance_error(file_url, file, error, partial);
            }
        };
        let search_doc = search_doc_with_card_type(&built, chain.display_names.first());

        let html = match self.render_all(&built, &chain).await {
            Ok(html) => html,
            Err(e) => {
                let partial = Partial {
                    deps,
                    search_doc: Some(search_doc),
                    chain: Some(chain),
                };
                let error = SerializedError::new(e.to_string(), 500);
                return self.record_instance_error(file_url, file, error, partial);
            }
        };

        deps.remove(file_url);
        deps.remove(&instance_url);
        let entry = InstanceEntry {
            resource: with_instance_meta(built.serialized, &instance_url, file),
            source: file.content.clone(),
            search_doc,
            deps,
            types: chain.keys(),
            display_names: chain.display_names,
            isolated_html: Some(html.isolated),
            atom_html: Some(html.atom),
            embedded_html: Some(html.embedded),
            fitted_html: Some(html.fitted),
            last_modified: file.last_modified,
            resource_created_at: file.created,
        };
        self.with_batch(|batch| batch.update_entry(file_url, &IndexEntry::Instance(entry)))?;
        self.bump(|s| s.instances_indexed += 1);
        Ok(())
    }

    fn record_instance_error(
        &self,
        file_url: &str,
        file: &FileRef,
        mut error: SerializedError,
        partial: Partial,
    ) -> Result<(), RunnerError> {
        tracing::warn!(url = %file_url, error = %error.message, "encountered error indexing card instance");
        let instance_url = file_url.strip_suffix(".json").unwrap_or(file_url);
        error.add_deps(partial.deps.into_iter().filter(|dep| dep != file_url && dep != instance_url));

        let entry = ErrorEntry {
            search_doc: partial.search_doc,
            types: partial.chain.as_ref().map(TypeChain::keys),
            display_names: partial.chain.map(|chain| chain.display_names),
            last_modified: Some(file.last_modified),
            resource_created_at: Some(file.created),
            ..ErrorEntry::new(error)
        };
        self.with_batch(|batch| batch.update_entry(file_url, &IndexEntry::Error(entry)))?;
        self.bump(|s| s.instance_errors += 1);
        Ok(())
    }

    async fn render_all(&self, card: &BuiltCard, chain: &TypeChain) -> Result<RenderedHtml, RenderError> {
        let isolated = self.render(card, RenderFormat::Isolated, None).await?;
        let atom = self.render(card, RenderFormat::Atom, None).await?;
        let mut embedded = BTreeMap::new();
        let mut fitted = BTreeMap::new();
        for code_ref in &chain.code_refs {
            let key = code_ref.internal_key();
            embedded.insert(key.clone(), self.render(card, RenderFormat::Embedded, Some(code_ref)).await?);
            fitted.insert(key, self.render(card, RenderFormat::Fitted, Some(code_ref)).await?);
        }
        Ok(RenderedHtml { isolated, atom, embedded, fitted })
    }

    async fn render(
        &self,
        card: &BuiltCard,
        format: RenderFormat,
        as_type: Option<&CodeRef>,
    ) -> Result<String, RenderError> {
        tokio::time::timeout(self.render_timeout, self.renderer.render(card, format, as_type))
            .await
            .map_err(|_| RenderError::Timeout { format, timeout: self.render_timeout })?
    }
}

/// Whatever was derived before an instance failed.
#[derive(Default)]
struct Partial {
    deps: BTreeSet<String>,
    search_doc: Option<Value>,
    chain: Option<TypeChain>,
}

struct RenderedHtml {
    isolated: String,
    atom: String,
    embedded: BTreeMap<String, String>,
    fitted: BTreeMap<String, String>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Executable modules first so instances see fresh definitions, then lexical.
fn sort_invalidations(mut urls: Vec<String>) -> Vec<String> {
    urls.sort_by(|a, b| {
        has_executable_extension(b)
            .cmp(&has_executable_extension(a))
            .then_with(|| a.cmp(b))
    });
    urls
}

fn search_doc_with_card_type(card: &BuiltCard, display_name: Option<&String>) -> Value {
    let mut doc = card.search_doc.clone();
    if let Value::Object(map) = &mut doc {
        let card_type = display_name.cloned().unwrap_or_else(|| card.card_type.name.clone());
        map.entry(CARD_TYPE_FIELD).or_insert(Value::String(card_type));
    }
    doc
}

fn with_instance_meta(mut resource: Value, instance_url: &str, file: &FileRef) -> Value {
    if let Value::Object(map) = &mut resource {
        map.insert("id".into(), Value::String(instance_url.to_string()));
        let meta = map.entry("meta").or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(meta) = meta {
            meta.insert("lastModified".into(), file.last_modified.into());
            meta.insert("resourceCreatedAt".into(), file.created.into());
        }
    }
    resource
}
