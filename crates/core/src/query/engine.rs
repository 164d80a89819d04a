//! Query engine over the realm index.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use rusqlite::params_from_iter;
use serde_json::Value;
use thiserror::Error;

use super::fields::{FieldResolver, field_refs};
use super::filter::{
    HtmlFormat, PageMeta, PrerenderedCard, PrerenderedResults, Query, QueryOptions,
    QueryResultsMeta, SearchResults,
};
use super::sql::{FilterTranslator, Fragment, VersionBound, base_conditions, build_search};
use crate::code_ref::CodeRef;
use crate::config::QueryConfig;
use crate::index::db::{current_version, json_column, latest_version};
use crate::index::{CardTypeSummary, IndexDb, IndexError};
use crate::paths::{RealmPaths, is_css};
use crate::runner::collaborators::CardEvaluator;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Your filter refers to nonexistent type: {}", import_statement(.module, .name))]
    UnknownType { module: String, name: String },

    #[error("Your filter refers to nonexistent field \"{field}\" on type {}", code_ref_json(.on))]
    UnknownField { field: String, on: CodeRef },

    #[error("{0}")]
    InvalidQuery(String),

    #[error("card evaluator failed: {0}")]
    Evaluator(String),

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl From<rusqlite::Error> for QueryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Index(IndexError::Database(err))
    }
}

fn import_statement(module: &str, name: &str) -> String {
    if name == "default" {
        format!("import {name} from \"{module}\"")
    } else {
        format!("import {{ {name} }} from \"{module}\"")
    }
}

fn code_ref_json(code_ref: &CodeRef) -> String {
    serde_json::to_string(code_ref).unwrap_or_else(|_| code_ref.to_string())
}

/// Filters, sorts and paginates indexed instances of a realm.
pub struct QueryEngine {
    db: Arc<IndexDb>,
    evaluator: Arc<dyn CardEvaluator>,
    base_card: CodeRef,
}

impl QueryEngine {
    pub fn new(db: Arc<IndexDb>, evaluator: Arc<dyn CardEvaluator>) -> Self {
        Self { db, evaluator, base_card: QueryConfig::default().base_card() }
    }

    /// Engine whose root type comes from the query config.
    pub fn from_config(
        db: Arc<IndexDb>,
        evaluator: Arc<dyn CardEvaluator>,
        config: &QueryConfig,
    ) -> Self {
        Self::new(db, evaluator).with_base_card(config.base_card())
    }

    /// Root type for filters and sorts that carry no `on`.
    pub fn with_base_card(mut self, base_card: CodeRef) -> Self {
        self.base_card = base_card;
        self
    }

    /// Matching instances' serialized resources.
    pub async fn search(
        &self,
        realm_url: &str,
        query: &Query,
        opts: &QueryOptions,
    ) -> Result<SearchResults, QueryError> {
        let (rows, meta) = self
            .execute(realm_url, query, opts, "i.url, i.pristine_doc", |row| {
                row.get::<_, Option<String>>(1)
            })
            .await?;

        let mut cards = Vec::with_capacity(rows.len());
        for doc in rows {
            if let Some(card) = json_column::<Value>(&doc)? {
                cards.push(card);
            }
        }
        Ok(SearchResults { cards, meta })
    }

    /// Matching instances' stored html in the requested format.
    pub async fn search_prerendered(
        &self,
        realm_url: &str,
        query: &Query,
        opts: &QueryOptions,
    ) -> Result<PrerenderedResults, QueryError> {
        let format = opts.html_format.ok_or_else(|| {
            QueryError::InvalidQuery("htmlFormat must be either 'embedded', 'fitted', or 'atom'".into())
        })?;
        let columns = format!("i.url, i.type, i.types, i.deps, i.{format}_html");

        let (rows, meta) = self
            .execute(realm_url, query, opts, &columns, |row| {
                Ok(PrerenderedRow {
                    url: row.get(0)?,
                    entry_type: row.get(1)?,
                    types: row.get(2)?,
                    deps: row.get(3)?,
                    html: row.get(4)?,
                })
            })
            .await?;

        let mut scoped_css_urls = Vec::new();
        let mut seen_css = HashSet::new();
        let mut prerendered_cards = Vec::with_capacity(rows.len());
        for row in rows {
            let deps: Vec<String> = json_column(&row.deps)?.unwrap_or_default();
            for dep in deps {
                if is_css(&dep) && seen_css.insert(dep.clone()) {
                    scoped_css_urls.push(dep);
                }
            }

            let types: Vec<String> = json_column(&row.types)?.unwrap_or_default();
            let (html, used) = self.pick_html(format, row.html, &types, opts.render_type.as_ref())?;
            prerendered_cards.push(PrerenderedCard {
                url: row.url,
                html,
                used_render_type: CodeRef::from_internal_key(&used)
                    .unwrap_or_else(|| self.base_card.clone()),
                is_error: row.entry_type == "error",
            });
        }

        Ok(PrerenderedResults { prerendered_cards, scoped_css_urls, meta })
    }

    /// Card type summary of the realm's production version.
    pub fn fetch_card_type_summary(&self, realm_url: &str) -> Result<Vec<CardTypeSummary>, QueryError> {
        Ok(self.db.fetch_card_type_summary(&normalize_realm(realm_url)?)?)
    }

    /// Resolve fields, then run the select and count statements against one
    /// fixed version under a single connection lock.
    async fn execute<T, F>(
        &self,
        realm_url: &str,
        query: &Query,
        opts: &QueryOptions,
        columns: &str,
        map: F,
    ) -> Result<(Vec<T>, QueryResultsMeta), QueryError>
    where
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let realm_url = normalize_realm(realm_url)?;
        let refs = field_refs(query, &self.base_card);
        let fields = FieldResolver::new(self.evaluator.as_ref()).resolve_all(&refs).await?;

        let conn = self.db.connection()?;
        let (bound, realm_version) = match query.page.and_then(|p| p.realm_version) {
            Some(version) => (VersionBound::Pinned(version), version),
            None if opts.use_work_in_progress_index => {
                (VersionBound::WorkInProgress, latest_version(&conn, &realm_url)?.unwrap_or(0))
            }
            None => {
                let current = current_version(&conn, &realm_url)?.unwrap_or(0);
                (VersionBound::Pinned(current), current)
            }
        };

        let translator = FilterTranslator::new(&fields);
        let filter = match &query.filter {
            Some(filter) => translator.condition(filter, &self.base_card)?,
            None => Fragment::raw("1=1"),
        };
        let order = translator.order_by(&query.sort)?;
        let sql = build_search(
            columns,
            base_conditions(&realm_url, bound, opts),
            filter,
            order,
            query.page.as_ref(),
        );

        let total: i64 = conn.query_row(
            &sql.count.sql,
            params_from_iter(sql.count.params.iter()),
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(&sql.select.sql)?;
        let rows = stmt
            .query_map(params_from_iter(sql.select.params.iter()), map)?
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            realm = %realm_url,
            realm_version,
            total,
            returned = rows.len(),
            "search"
        );
        Ok((rows, QueryResultsMeta { page: PageMeta { total, realm_version } }))
    }

    /// Html for a row and the internal key of the type it was rendered as.
    ///
    /// Embedded and fitted html are stored per type: the requested render
    /// type wins, then the instance's own types from most specific, then the
    /// base card.
    fn pick_html(
        &self,
        format: HtmlFormat,
        column: Option<String>,
        types: &[String],
        render_type: Option<&CodeRef>,
    ) -> Result<(Option<String>, String), QueryError> {
        let most_specific = types.first().cloned().unwrap_or_else(|| self.base_card.internal_key());
        if format == HtmlFormat::Atom {
            return Ok((column, most_specific));
        }

        let by_type: BTreeMap<String, String> = json_column(&column)?.unwrap_or_default();
        let candidates = render_type
            .map(CodeRef::internal_key)
            .into_iter()
            .chain(types.iter().cloned())
            .chain(std::iter::once(self.base_card.internal_key()));
        for key in candidates {
            if let Some(html) = by_type.get(&key) {
                return Ok((Some(html.clone()), key));
            }
        }
        Ok((None, most_specific))
    }
}

struct PrerenderedRow {
    url: String,
    entry_type: String,
    types: Option<String>,
    deps: Option<String>,
    html: Option<String>,
}

fn normalize_realm(realm_url: &str) -> Result<String, QueryError> {
    RealmPaths::new(realm_url)
        .map(|paths| paths.url().to_string())
        .map_err(|e| QueryError::InvalidQuery(format!("invalid realm url {realm_url}: {e}")))
}
