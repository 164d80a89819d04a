mod cmd;
mod logging;

use clap::{Args, Parser, Subcommand, ValueEnum};
use realm_index_core::config::LoggingConfig;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "realm-index", version, about = "Inspect and maintain a realm index database")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Index database to open instead of the configured one
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate configuration and print resolved settings
    Doctor,

    /// Show indexed realms with their production version and entry counts
    Status(StatusArgs),

    /// Print an indexed instance, module or stylesheet as JSON
    Get(GetArgs),

    /// List production modification times of a realm's entries
    Mtimes(RealmArgs),

    /// Summarize a realm's instances by most specific card type
    Types(RealmArgs),

    /// Delete uncommitted index generations above a realm's production version
    DiscardWip(DiscardArgs),
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Only show this realm
    pub realm: Option<String>,

    #[arg(long, short, value_enum, default_value_t)]
    pub output: OutputFormat,

    /// Shorthand for --output json
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct RealmArgs {
    /// Realm url, e.g. http://localhost:4201/experiments/
    pub realm: String,

    #[arg(long, short, value_enum, default_value_t)]
    pub output: OutputFormat,

    /// Shorthand for --output json
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum EntryKind {
    #[default]
    Instance,
    Module,
    Css,
}

#[derive(Debug, Args)]
pub struct GetArgs {
    /// Resource url; instances and modules may omit their extension
    pub url: String,

    #[arg(long, short, value_enum, default_value_t)]
    pub kind: EntryKind,

    /// Read the newest rows, including an unfinished batch
    #[arg(long)]
    pub wip: bool,
}

#[derive(Debug, Args)]
pub struct DiscardArgs {
    /// Realm url whose unfinished generations are removed
    pub realm: String,
}

fn main() {
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    let db = cli.db.as_deref();

    match cli.command {
        Commands::Doctor => {
            logging::init(&LoggingConfig::default());
            cmd::doctor::run(config);
        }
        Commands::Status(args) => cmd::status::run(&cmd::resolve(config, db), args),
        Commands::Get(args) => cmd::get::run(&cmd::resolve(config, db), args),
        Commands::Mtimes(args) => cmd::mtimes::run(&cmd::resolve(config, db), args),
        Commands::Types(args) => cmd::types::run(&cmd::resolve(config, db), args),
        Commands::DiscardWip(args) => cmd::discard_wip::run(&cmd::resolve(config, db), args),
    }

    logging::shutdown();
}
