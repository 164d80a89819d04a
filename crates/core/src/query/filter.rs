//! Query DSL: filters, sorts, pages and result shapes.
//!
//! The wire form is JSON, e.g.
//!
//! ```json
//! {
//!   "filter": { "on": { "module": "http://x/person", "name": "Person" }, "eq": { "name": "Mango" } },
//!   "sort": [{ "by": "lastModified", "direction": "desc" }],
//!   "page": { "number": 0, "size": 10 }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::code_ref::CodeRef;

/// A recursively composable filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFilter", into = "RawFilter")]
pub enum Filter {
    /// `{}`: every alive instance.
    Everything,
    /// `{type}`: instances whose ancestry includes the type.
    Type(CodeRef),
    Eq { on: Option<CodeRef>, fields: BTreeMap<String, Value> },
    Contains { on: Option<CodeRef>, fields: BTreeMap<String, Value> },
    Range { on: Option<CodeRef>, fields: BTreeMap<String, RangeBounds> },
    Not { on: Option<CodeRef>, filter: Box<Filter> },
    Every { on: Option<CodeRef>, filters: Vec<Filter> },
    Any { on: Option<CodeRef>, filters: Vec<Filter> },
}

impl Filter {
    pub fn eq(on: CodeRef, field: &str, value: impl Into<Value>) -> Self {
        Self::Eq { on: Some(on), fields: BTreeMap::from([(field.to_string(), value.into())]) }
    }

    pub fn contains(on: CodeRef, field: &str, value: impl Into<Value>) -> Self {
        Self::Contains { on: Some(on), fields: BTreeMap::from([(field.to_string(), value.into())]) }
    }

    pub fn not(filter: Filter) -> Self {
        Self::Not { on: None, filter: Box::new(filter) }
    }

    pub fn every(filters: Vec<Filter>) -> Self {
        Self::Every { on: None, filters }
    }

    pub fn any(filters: Vec<Filter>) -> Self {
        Self::Any { on: None, filters }
    }

    /// The filter's own `on`, if it has one.
    pub fn on(&self) -> Option<&CodeRef> {
        match self {
            Self::Everything | Self::Type(_) => None,
            Self::Eq { on, .. }
            | Self::Contains { on, .. }
            | Self::Range { on, .. }
            | Self::Not { on, .. }
            | Self::Every { on, .. }
            | Self::Any { on, .. } => on.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeOperator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl RangeOperator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// Bounds of one range field. Values are kept raw so `null` can be rejected.
pub type RangeBounds = BTreeMap<RangeOperator, Value>;

/// Serde shape of a filter object; exactly one operator key is allowed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    on: Option<CodeRef>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    type_: Option<CodeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    eq: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    contains: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range: Option<BTreeMap<String, RangeBounds>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    not: Option<Box<Filter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    every: Option<Vec<Filter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    any: Option<Vec<Filter>>,
}

impl TryFrom<RawFilter> for Filter {
    type Error = String;

    fn try_from(raw: RawFilter) -> Result<Self, Self::Error> {
        let operators = [
            raw.type_.is_some(),
            raw.eq.is_some(),
            raw.contains.is_some(),
            raw.range.is_some(),
            raw.not.is_some(),
            raw.every.is_some(),
            raw.any.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count();
        if operators > 1 {
            return Err("a filter may use only one of type, eq, contains, range, not, every, any"
                .to_string());
        }

        let on = raw.on;
        Ok(if let Some(code_ref) = raw.type_ {
            Self::Type(code_ref)
        } else if let Some(fields) = raw.eq {
            Self::Eq { on, fields }
        } else if let Some(fields) = raw.contains {
            Self::Contains { on, fields }
        } else if let Some(fields) = raw.range {
            Self::Range { on, fields }
        } else if let Some(filter) = raw.not {
            Self::Not { on, filter }
        } else if let Some(filters) = raw.every {
            Self::Every { on, filters }
        } else if let Some(filters) = raw.any {
            Self::Any { on, filters }
        } else if on.is_some() {
            return Err("a filter with `on` needs an operator".to_string());
        } else {
            Self::Everything
        })
    }
}

impl From<Filter> for RawFilter {
    fn from(filter: Filter) -> Self {
        match filter {
            Filter::Everything => Self::default(),
            Filter::Type(code_ref) => Self { type_: Some(code_ref), ..Self::default() },
            Filter::Eq { on, fields } => Self { on, eq: Some(fields), ..Self::default() },
            Filter::Contains { on, fields } => Self { on, contains: Some(fields), ..Self::default() },
            Filter::Range { on, fields } => Self { on, range: Some(fields), ..Self::default() },
            Filter::Not { on, filter } => Self { on, not: Some(filter), ..Self::default() },
            Filter::Every { on, filters } => Self { on, every: Some(filters), ..Self::default() },
            Filter::Any { on, filters } => Self { on, any: Some(filters), ..Self::default() },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortExpression {
    /// Type the field belongs to; without it only general fields may be used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<CodeRef>,
    pub by: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortExpression {
    pub fn on(on: CodeRef, by: &str, direction: SortDirection) -> Self {
        Self { on: Some(on), by: by.to_string(), direction }
    }

    pub fn general(by: &str, direction: SortDirection) -> Self {
        Self { on: None, by: by.to_string(), direction }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub number: u64,
    pub size: u64,
    /// Pin the read to a realm version returned by an earlier page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm_version: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortExpression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<Page>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HtmlFormat {
    Embedded,
    Fitted,
    Atom,
}

impl fmt::Display for HtmlFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Embedded => "embedded",
            Self::Fitted => "fitted",
            Self::Atom => "atom",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Read the newest rows, including uncommitted ones.
    pub use_work_in_progress_index: bool,
    /// Include `.json` error rows next to instances.
    pub include_errors: bool,
    /// Restrict results to these instance urls.
    pub card_urls: Vec<String>,
    /// Required by prerendered searches.
    pub html_format: Option<HtmlFormat>,
    /// Preferred type to take prerendered html from.
    pub render_type: Option<CodeRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub total: i64,
    pub realm_version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResultsMeta {
    pub page: PageMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResults {
    pub cards: Vec<Value>,
    pub meta: QueryResultsMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerenderedCard {
    pub url: String,
    pub html: Option<String>,
    pub used_render_type: CodeRef,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerenderedResults {
    pub prerendered_cards: Vec<PrerenderedCard>,
    pub scoped_css_urls: Vec<String>,
    pub meta: QueryResultsMeta,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_nested_filter() {
        let filter: Filter = serde_json::from_value(json!({
            "on": { "module": "http://x/person", "name": "Person" },
            "any": [
                { "eq": { "name": "Mango" } },
                { "not": { "contains": { "name": "ngo" } } },
                { "range": { "age": { "gt": 3, "lte": 10 } } },
                { "type": { "module": "http://x/pet", "name": "Pet" } }
            ]
        }))
        .unwrap();

        match filter {
            Filter::Any { on: Some(on), filters } => {
                assert_eq!(on.name, "Person");
                assert_eq!(filters.len(), 4);
                assert!(matches!(filters[1], Filter::Not { .. }));
                match &filters[2] {
                    Filter::Range { fields, .. } => {
                        assert_eq!(fields["age"][&RangeOperator::Gt], json!(3));
                    }
                    other => panic!("expected range, got {other:?}"),
                }
            }
            other => panic!("expected any, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter: Filter = serde_json::from_value(json!({})).unwrap();
        assert_eq!(filter, Filter::Everything);
    }

    #[test]
    fn test_range_keeps_null_operands() {
        let filter: Filter = serde_json::from_value(json!({ "range": { "age": { "gt": null } } })).unwrap();
        match filter {
            Filter::Range { fields, .. } => assert_eq!(fields["age"][&RangeOperator::Gt], Value::Null),
            other => panic!("expected range, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_ambiguous_filters() {
        assert!(serde_json::from_value::<Filter>(json!({ "eq": {}, "contains": {} })).is_err());
        assert!(serde_json::from_value::<Filter>(json!({ "eqq": { "name": "x" } })).is_err());
    }

    #[test]
    fn test_query_round_trip_shape() {
        let query: Query = serde_json::from_value(json!({
            "filter": { "type": { "module": "http://x/person", "name": "Person" } },
            "sort": [{ "by": "createdAt", "direction": "desc" }],
            "page": { "number": 1, "size": 3, "realmVersion": 7 }
        }))
        .unwrap();
        assert_eq!(query.sort[0].direction, SortDirection::Desc);
        assert_eq!(query.page.unwrap().realm_version, Some(7));

        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(value["page"]["realmVersion"], json!(7));
        assert_eq!(value["filter"]["type"]["name"], json!("Person"));
    }
}
