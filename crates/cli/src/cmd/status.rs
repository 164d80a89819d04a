//! Status command implementation.

use std::collections::BTreeMap;

use realm_index_core::index::{EntryType, IndexDb, IndexError};
use serde::Serialize;
use tabled::Tabled;

use super::output::{print_json, print_table};
use super::{Context, open_db, realm_url, resolve_format};
use crate::{OutputFormat, StatusArgs};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealmStatus {
    realm_url: String,
    current_version: i64,
    latest_version: i64,
    entries: BTreeMap<String, i64>,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Realm")]
    realm: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Instances")]
    instances: i64,
    #[tabled(rename = "Modules")]
    modules: i64,
    #[tabled(rename = "Css")]
    css: i64,
    #[tabled(rename = "Errors")]
    errors: i64,
}

impl From<&RealmStatus> for StatusRow {
    fn from(s: &RealmStatus) -> Self {
        let count = |t: EntryType| s.entries.get(t.as_str()).copied().unwrap_or(0);
        let version = if s.latest_version > s.current_version {
            format!("{} (wip {})", s.current_version, s.latest_version)
        } else {
            s.current_version.to_string()
        };
        Self {
            realm: s.realm_url.clone(),
            version,
            instances: count(EntryType::Instance),
            modules: count(EntryType::Module),
            css: count(EntryType::Css),
            errors: count(EntryType::Error),
        }
    }
}

pub fn run(ctx: &Context, args: StatusArgs) {
    let db = open_db(ctx);

    let realms = match db.list_realms() {
        Ok(realms) => realms,
        Err(e) => {
            eprintln!("Error listing realms: {}", e);
            std::process::exit(1);
        }
    };
    let wanted = args.realm.as_deref().map(realm_url);

    let mut statuses = Vec::new();
    for (realm, current_version) in realms {
        if wanted.as_ref().is_some_and(|w| *w != realm) {
            continue;
        }
        match realm_status(&db, realm, current_version) {
            Ok(status) => statuses.push(status),
            Err(e) => {
                eprintln!("Error reading realm status: {}", e);
                std::process::exit(1);
            }
        }
    }

    if let Some(wanted) = wanted
        && statuses.is_empty()
    {
        eprintln!("Realm {} has no committed index", wanted);
        std::process::exit(1);
    }

    match resolve_format(args.output, args.json) {
        OutputFormat::Table => {
            let rows: Vec<StatusRow> = statuses.iter().map(StatusRow::from).collect();
            print_table(&rows, "no indexed realms");
        }
        OutputFormat::Json => print_json(&statuses),
    }
}

fn realm_status(
    db: &IndexDb,
    realm_url: String,
    current_version: i64,
) -> Result<RealmStatus, IndexError> {
    let entries = db
        .count_by_type(&realm_url)?
        .into_iter()
        .map(|(t, n)| (t.as_str().to_string(), n))
        .collect();
    let latest_version = db.latest_version(&realm_url)?.unwrap_or(current_version);
    Ok(RealmStatus { realm_url, current_version, latest_version, entries })
}
