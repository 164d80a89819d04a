//! Structured search over indexed instances.
//!
//! A [`Query`] is validated against card definitions (every field path must
//! exist on the type it is addressed to), translated to SQL over the search
//! doc JSON and run against a single realm version.

pub mod engine;
pub mod fields;
pub mod filter;
pub mod sql;

pub use engine::{QueryEngine, QueryError};
pub use fields::{CARD_TYPE_FIELD, FieldResolver, ResolvedFields, ResolvedPath};
pub use filter::{
    Filter, HtmlFormat, Page, PageMeta, PrerenderedCard, PrerenderedResults, Query, QueryOptions,
    QueryResultsMeta, RangeBounds, RangeOperator, SearchResults, SortDirection, SortExpression,
};
