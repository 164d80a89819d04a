//! Card type summary of a realm's production generation.

use realm_index_core::index::CardTypeSummary;
use tabled::Tabled;

use super::output::{print_json, print_table};
use super::{Context, open_db, realm_url, resolve_format};
use crate::{OutputFormat, RealmArgs};

#[derive(Tabled)]
struct TypeRow {
    #[tabled(rename = "Card type")]
    code_ref: String,
    #[tabled(rename = "Name")]
    display_name: String,
    #[tabled(rename = "Instances")]
    total: i64,
}

impl From<&CardTypeSummary> for TypeRow {
    fn from(s: &CardTypeSummary) -> Self {
        Self {
            code_ref: s.code_ref.clone(),
            display_name: s.display_name.clone().unwrap_or_default(),
            total: s.total,
        }
    }
}

pub fn run(ctx: &Context, args: RealmArgs) {
    let db = open_db(ctx);
    let realm = realm_url(&args.realm);

    let summary = match db.fetch_card_type_summary(&realm) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Error reading card type summary: {}", e);
            std::process::exit(1);
        }
    };

    match resolve_format(args.output, args.json) {
        OutputFormat::Table => {
            let rows: Vec<TypeRow> = summary.iter().map(TypeRow::from).collect();
            print_table(&rows, "no card instances");
        }
        OutputFormat::Json => print_json(&summary),
    }
}
