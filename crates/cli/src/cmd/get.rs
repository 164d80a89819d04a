//! Get command implementation.

use realm_index_core::index::{GetEntryOptions, InstanceOrError, SourceOrError};

use super::output::{ErrorOutput, InstanceOutput, SourceOutput, print_json};
use super::{Context, open_db};
use crate::{EntryKind, GetArgs};

pub fn run(ctx: &Context, args: GetArgs) {
    let db = open_db(ctx);
    let opts = GetEntryOptions { use_work_in_progress_index: args.wip };

    let found = match args.kind {
        EntryKind::Instance => db.get_instance(&args.url, opts).map(|entry| {
            entry.map(|entry| match entry {
                InstanceOrError::Instance(i) => print_json(&InstanceOutput::from(&i)),
                InstanceOrError::Error(e) => print_json(&ErrorOutput::from(&e)),
            })
        }),
        EntryKind::Module => db.get_module(&args.url, opts).map(|entry| entry.map(|e| print_source("module", &e))),
        EntryKind::Css => db.get_css(&args.url, opts).map(|entry| entry.map(|e| print_source("css", &e))),
    };

    match found {
        Ok(Some(())) => {}
        Ok(None) => {
            eprintln!("Nothing indexed at {}", args.url);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error reading index: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_source(entry_type: &'static str, entry: &SourceOrError) {
    match entry {
        SourceOrError::Source(s) => print_json(&SourceOutput::new(entry_type, s)),
        SourceOrError::Error { canonical_url, error } => {
            print_json(&ErrorOutput::new(canonical_url, None, error))
        }
    }
}
