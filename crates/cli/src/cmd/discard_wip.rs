use super::{Context, open_db, realm_url};
use crate::DiscardArgs;

pub fn run(ctx: &Context, args: DiscardArgs) {
    let db = open_db(ctx);
    let realm = realm_url(&args.realm);

    match db.discard_work_in_progress(&realm) {
        Ok(0) => println!("No uncommitted index rows for {}", realm),
        Ok(rows) => println!("Discarded {} uncommitted index rows for {}", rows, realm),
        Err(e) => {
            eprintln!("Error discarding work in progress: {}", e);
            std::process::exit(1);
        }
    }
}
