use std::collections::BTreeMap;

use serde::Serialize;
use tabled::Tabled;

use super::output::{format_timestamp, print_json, print_table};
use super::{Context, open_db, realm_url, resolve_format};
use crate::{OutputFormat, RealmArgs};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MtimeOutput {
    #[serde(rename = "type")]
    entry_type: &'static str,
    last_modified: Option<i64>,
}

#[derive(Tabled)]
struct MtimeRow {
    #[tabled(rename = "Url")]
    url: String,
    #[tabled(rename = "Type")]
    entry_type: &'static str,
    #[tabled(rename = "Last modified (UTC)")]
    last_modified: String,
}

pub fn run(ctx: &Context, args: RealmArgs) {
    let db = open_db(ctx);
    let realm = realm_url(&args.realm);

    let mtimes = match db.get_modified_times(&realm) {
        Ok(mtimes) => mtimes,
        Err(e) => {
            eprintln!("Error reading modification times: {}", e);
            std::process::exit(1);
        }
    };

    match resolve_format(args.output, args.json) {
        OutputFormat::Table => {
            let rows: Vec<MtimeRow> = mtimes
                .iter()
                .map(|(url, m)| MtimeRow {
                    url: url.clone(),
                    entry_type: m.entry_type.as_str(),
                    last_modified: format_timestamp(m.last_modified),
                })
                .collect();
            print_table(&rows, "no indexed entries");
        }
        OutputFormat::Json => {
            let out: BTreeMap<&str, MtimeOutput> = mtimes
                .iter()
                .map(|(url, m)| {
                    let entry = MtimeOutput {
                        entry_type: m.entry_type.as_str(),
                        last_modified: m.last_modified,
                    };
                    (url.as_str(), entry)
                })
                .collect();
            print_json(&out);
        }
    }
}
