//! Shared output formatting for database commands.

use chrono::DateTime;
use realm_index_core::index::{
    IndexedInstance, IndexedInstanceError, IndexedSource, SerializedError,
};
use serde::Serialize;
use serde_json::Value;
use tabled::{Table, Tabled, settings::Style};

/// An indexed instance for JSON output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceOutput<'a> {
    #[serde(rename = "type")]
    pub entry_type: &'static str,
    pub url: &'a str,
    pub realm_url: &'a str,
    pub realm_version: i64,
    pub instance: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_doc: Option<&'a Value>,
    pub types: &'a [String],
    pub display_names: &'a [String],
    pub deps: &'a [String],
    pub last_modified: Option<i64>,
    pub resource_created_at: Option<i64>,
    pub indexed_at: Option<i64>,
}

impl<'a> From<&'a IndexedInstance> for InstanceOutput<'a> {
    fn from(i: &'a IndexedInstance) -> Self {
        Self {
            entry_type: "instance",
            url: &i.canonical_url,
            realm_url: &i.realm_url,
            realm_version: i.realm_version,
            instance: &i.instance,
            search_doc: i.search_doc.as_ref(),
            types: &i.types,
            display_names: &i.display_names,
            deps: &i.deps,
            last_modified: i.last_modified,
            resource_created_at: i.resource_created_at,
            indexed_at: i.indexed_at,
        }
    }
}

/// An indexed module or stylesheet for JSON output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceOutput<'a> {
    #[serde(rename = "type")]
    pub entry_type: &'static str,
    pub url: &'a str,
    pub realm_version: i64,
    pub deps: &'a [String],
    pub last_modified: Option<i64>,
    pub indexed_at: Option<i64>,
    pub source: &'a str,
}

impl<'a> SourceOutput<'a> {
    pub fn new(entry_type: &'static str, s: &'a IndexedSource) -> Self {
        Self {
            entry_type,
            url: &s.canonical_url,
            realm_version: s.realm_version,
            deps: &s.deps,
            last_modified: s.last_modified,
            indexed_at: s.indexed_at,
            source: &s.source,
        }
    }
}

/// An error row for JSON output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOutput<'a> {
    #[serde(rename = "type")]
    pub entry_type: &'static str,
    pub url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realm_version: Option<i64>,
    pub error: &'a SerializedError,
}

impl<'a> ErrorOutput<'a> {
    pub fn new(url: &'a str, realm_version: Option<i64>, error: &'a SerializedError) -> Self {
        Self { entry_type: "error", url, realm_version, error }
    }
}

impl<'a> From<&'a IndexedInstanceError> for ErrorOutput<'a> {
    fn from(e: &'a IndexedInstanceError) -> Self {
        Self::new(&e.canonical_url, Some(e.realm_version), &e.error)
    }
}

/// Print rows as a rounded table, or a placeholder when there are none.
pub fn print_table<T: Tabled>(rows: &[T], empty: &str) {
    if rows.is_empty() {
        println!("({empty})");
        return;
    }
    println!("{}", Table::new(rows).with(Style::rounded()));
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            std::process::exit(1);
        }
    }
}

/// Unix seconds rendered in UTC.
pub fn format_timestamp(secs: Option<i64>) -> String {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(Some(0)), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(Some(1_700_000_000)), "2023-11-14 22:13:20");
        assert_eq!(format_timestamp(None), "-");
    }
}
