//! Translation of filters and sorts into SQLite over JSON columns.
//!
//! Singular field paths read the search doc with `json_extract`. Paths that
//! travel through a plural field become an `EXISTS` over `json_tree` rooted
//! at the first plural segment, restricted by a `fullkey LIKE` pattern, so an
//! instance matches once no matter how many branches satisfy the predicate.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use super::engine::QueryError;
use super::fields::{ResolvedFields, ResolvedPath};
use super::filter::{Filter, Page, QueryOptions, RangeBounds, SortExpression};
use crate::code_ref::CodeRef;
use crate::index::db::{ALIVE, WORK_IN_PROGRESS_BOUND, latest_row_condition};
use crate::index::writer::placeholders;
use crate::paths::ensure_json_suffix;

/// A SQL snippet with its positional (`?`) parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Fragment {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self { sql: sql.into(), params }
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }

    fn join(parts: Vec<Fragment>, op: &str, empty: &str) -> Self {
        if parts.is_empty() {
            return Self::raw(empty);
        }
        if parts.len() == 1 {
            return parts.into_iter().next().unwrap_or_default();
        }
        let mut params = Vec::new();
        let mut sqls = Vec::with_capacity(parts.len());
        for part in parts {
            sqls.push(format!("({})", part.sql));
            params.extend(part.params);
        }
        Self::new(sqls.join(op), params)
    }

    /// Conjunction; an empty list is true.
    pub fn every(parts: Vec<Fragment>) -> Self {
        Self::join(parts, " AND ", "1=1")
    }

    /// Disjunction; an empty list is false.
    pub fn any(parts: Vec<Fragment>) -> Self {
        Self::join(parts, " OR ", "1=0")
    }

    pub fn negate(inner: Fragment) -> Self {
        Self::new(format!("NOT ({})", inner.sql), inner.params)
    }
}

/// Which generation a search reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionBound {
    /// A fixed version: production at the time of the first page, or one
    /// echoed back from an earlier page.
    Pinned(i64),
    /// Committed rows overlaid with the newest uncommitted generation.
    WorkInProgress,
}

/// Maps sort fields without `on` to index columns.
pub fn general_sort_column(field: &str) -> Option<&'static str> {
    match field {
        "lastModified" => Some("i.last_modified"),
        "createdAt" => Some("i.resource_created_at"),
        _ => None,
    }
}

/// Conditions every search applies before its filter.
pub fn base_conditions(realm_url: &str, bound: VersionBound, opts: &QueryOptions) -> Fragment {
    let mut parts = vec![Fragment::new("i.realm_url = ?", vec![SqlValue::Text(realm_url.to_string())])];

    parts.push(match bound {
        VersionBound::Pinned(version) => Fragment::new(
            latest_row_condition("AND i2.realm_version <= ?"),
            vec![SqlValue::Integer(version)],
        ),
        VersionBound::WorkInProgress => Fragment::raw(latest_row_condition(WORK_IN_PROGRESS_BOUND)),
    });
    parts.push(Fragment::raw(ALIVE));

    parts.push(if opts.include_errors {
        Fragment::raw("i.type = 'instance' OR (i.type = 'error' AND i.url LIKE '%.json')")
    } else {
        Fragment::raw("i.type = 'instance'")
    });

    if !opts.card_urls.is_empty() {
        parts.push(Fragment::new(
            format!("i.url IN ({})", placeholders(opts.card_urls.len())),
            opts.card_urls.iter().map(|u| SqlValue::Text(ensure_json_suffix(u))).collect(),
        ));
    }
    Fragment::every(parts)
}

/// Instances whose ancestry includes `code_ref`.
pub fn type_condition(code_ref: &CodeRef) -> Fragment {
    Fragment::new(
        "EXISTS (SELECT 1 FROM json_each(i.types) te WHERE te.value = ?)",
        vec![SqlValue::Text(code_ref.internal_key())],
    )
}

/// Translates a filter tree using paths resolved ahead of time.
pub struct FilterTranslator<'a> {
    fields: &'a ResolvedFields,
}

impl<'a> FilterTranslator<'a> {
    pub fn new(fields: &'a ResolvedFields) -> Self {
        Self { fields }
    }

    /// Condition for `filter`, with `inherited` as the type for fields when
    /// the filter has no `on` of its own.
    pub fn condition(&self, filter: &Filter, inherited: &CodeRef) -> Result<Fragment, QueryError> {
        let on = filter.on().unwrap_or(inherited);
        let mut parts: Vec<Fragment> = filter.on().map(type_condition).into_iter().collect();

        match filter {
            Filter::Everything => return Ok(Fragment::raw("1=1")),
            Filter::Type(code_ref) => return Ok(type_condition(code_ref)),
            Filter::Eq { fields, .. } => {
                for (key, value) in fields {
                    parts.push(self.eq(on, key, value)?);
                }
            }
            Filter::Contains { fields, .. } => {
                for (key, value) in fields {
                    parts.push(self.contains(on, key, value)?);
                }
            }
            Filter::Range { fields, .. } => {
                for (key, bounds) in fields {
                    parts.push(self.range(on, key, bounds)?);
                }
            }
            Filter::Not { filter, .. } => {
                parts.push(Fragment::negate(self.condition(filter, on)?));
            }
            Filter::Every { filters, .. } => {
                for f in filters {
                    parts.push(self.condition(f, on)?);
                }
            }
            Filter::Any { filters, .. } => {
                let alternatives =
                    filters.iter().map(|f| self.condition(f, on)).collect::<Result<Vec<_>, _>>()?;
                parts.push(Fragment::any(alternatives));
            }
        }
        Ok(Fragment::every(parts))
    }

    /// `ORDER BY` clause; `url` is always the final key.
    pub fn order_by(&self, sort: &[SortExpression]) -> Result<Fragment, QueryError> {
        let mut terms = Vec::with_capacity(sort.len() + 1);
        let mut params = Vec::new();
        for s in sort {
            let expr = match &s.on {
                Some(on) => {
                    let path = self.path(on, &s.by)?;
                    params.push(SqlValue::Text(path.json_path()));
                    "json_extract(i.search_doc, ?)".to_string()
                }
                None => general_sort_column(&s.by)
                    .ok_or_else(|| QueryError::InvalidQuery(format!("Unknown sort field: {}", s.by)))?
                    .to_string(),
            };
            terms.push(format!("{expr} {} NULLS LAST", s.direction.as_sql()));
        }
        terms.push("i.url ASC".to_string());
        Ok(Fragment::new(format!("ORDER BY {}", terms.join(", ")), params))
    }

    fn path(&self, on: &CodeRef, key: &str) -> Result<&ResolvedPath, QueryError> {
        self.fields.get(on, key).ok_or_else(|| {
            QueryError::InvalidQuery(format!("field \"{key}\" on {on} was not resolved"))
        })
    }

    fn eq(&self, on: &CodeRef, key: &str, value: &Value) -> Result<Fragment, QueryError> {
        let path = self.path(on, key)?;
        if value.is_null() {
            return Ok(null_condition(path));
        }
        let (param, placeholder) = bind(value);
        Ok(compare(path, &format!("= {placeholder}"), param))
    }

    fn contains(&self, on: &CodeRef, key: &str, value: &Value) -> Result<Fragment, QueryError> {
        let path = self.path(on, key)?;
        let needle = match value {
            Value::Null => return Ok(null_condition(path)),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(compare(path, "LIKE ?", SqlValue::Text(format!("%{needle}%"))))
    }

    fn range(&self, on: &CodeRef, key: &str, bounds: &RangeBounds) -> Result<Fragment, QueryError> {
        let path = self.path(on, key)?;
        let mut parts = Vec::with_capacity(bounds.len());
        for (op, value) in bounds {
            if value.is_null() {
                return Err(QueryError::InvalidQuery(
                    "'null' is not a permitted value in a 'range' filter".to_string(),
                ));
            }
            let (param, placeholder) = bind(value);
            parts.push(compare(path, &format!("{} {placeholder}", op.as_sql()), param));
        }
        Ok(Fragment::every(parts))
    }
}

/// `<field> <predicate>` for singular paths, an `EXISTS` over the plural
/// branches otherwise.
fn compare(path: &ResolvedPath, predicate: &str, param: SqlValue) -> Fragment {
    if path.traveled_thru_plural() {
        tree_exists(path, false, &format!("t.value {predicate}"), vec![param])
    } else {
        Fragment::new(
            format!("json_extract(i.search_doc, ?) {predicate}"),
            vec![SqlValue::Text(path.json_path()), param],
        )
    }
}

/// Explicit `null`: a missing or null singular value, or a null plural
/// container / branch leaf.
fn null_condition(path: &ResolvedPath) -> Fragment {
    if path.traveled_thru_plural() {
        tree_exists(path, true, "t.type = 'null'", Vec::new())
    } else {
        Fragment::new(
            "json_extract(i.search_doc, ?) IS NULL",
            vec![SqlValue::Text(path.json_path())],
        )
    }
}

fn tree_exists(path: &ResolvedPath, container: bool, predicate: &str, params: Vec<SqlValue>) -> Fragment {
    let mut all = vec![
        SqlValue::Text(path.plural_root()),
        SqlValue::Text(path.full_key_pattern(container)),
    ];
    all.extend(params);
    Fragment::new(
        format!(
            "EXISTS (SELECT 1 FROM json_tree(i.search_doc, ?) t \
             WHERE t.fullkey LIKE ? ESCAPE '\\' AND {predicate})"
        ),
        all,
    )
}

/// Bind a JSON value; objects and arrays compare as normalized JSON text.
fn bind(value: &Value) -> (SqlValue, &'static str) {
    match value {
        Value::Null => (SqlValue::Null, "?"),
        Value::Bool(b) => (SqlValue::Integer(i64::from(*b)), "?"),
        Value::Number(n) => match n.as_i64() {
            Some(i) => (SqlValue::Integer(i), "?"),
            None => (SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)), "?"),
        },
        Value::String(s) => (SqlValue::Text(s.clone()), "?"),
        Value::Array(_) | Value::Object(_) => (SqlValue::Text(value.to_string()), "json(?)"),
    }
}

/// Assembled select and count statements for one search.
#[derive(Debug, Clone)]
pub struct SearchSql {
    pub select: Fragment,
    pub count: Fragment,
}

pub fn build_search(
    columns: &str,
    base: Fragment,
    filter: Fragment,
    order: Fragment,
    page: Option<&Page>,
) -> SearchSql {
    let conditions = Fragment::every(vec![base, filter]);

    let mut select_params = conditions.params.clone();
    select_params.extend(order.params);
    let mut select_sql = format!(
        "SELECT {columns} FROM index_entries i WHERE {} {}",
        conditions.sql, order.sql
    );
    if let Some(page) = page {
        select_sql.push_str(" LIMIT ? OFFSET ?");
        let size = i64::try_from(page.size).unwrap_or(i64::MAX);
        let offset = i64::try_from(page.number.saturating_mul(page.size)).unwrap_or(i64::MAX);
        select_params.push(SqlValue::Integer(size));
        select_params.push(SqlValue::Integer(offset));
    }

    SearchSql {
        select: Fragment::new(select_sql, select_params),
        count: Fragment::new(
            format!("SELECT COUNT(*) FROM index_entries i WHERE {}", conditions.sql),
            conditions.params,
        ),
    }
}
