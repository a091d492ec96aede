//! quire-admin
//!
//! Operator tool for a RocksDB-backed version log: list documents, dump a
//! document's log, check its integrity and inspect or rebuild its snapshot.
//!
//! Logging goes through `env_logger`; set `RUST_LOG=debug` for detail.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use quire_collab::{verify_document, CollabConfig, DocumentId, RocksLog, SnapshotManager, VersionLog};

#[derive(Parser)]
#[command(name = "quire-admin")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and repair a quire version log")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database directory, overriding `storage.path` from the configuration
    #[arg(long, value_name = "DIR")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List documents with their version and length
    List,

    /// Print version entries as JSON lines
    Log {
        document: DocumentId,

        /// Only entries after this version
        #[arg(long, default_value_t = 0)]
        since: u64,
    },

    /// Check version contiguity and length chaining
    Verify { document: DocumentId },

    /// Print the materialised content of a document
    Snapshot {
        document: DocumentId,

        /// Replay from version 1 and persist the result
        #[arg(long)]
        rebuild: bool,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Returns false when a check found problems.
fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => CollabConfig::load(path)?,
        None => CollabConfig::default(),
    };
    if let Some(db) = cli.db {
        config.storage.path = Some(db);
    }
    let path = config
        .storage
        .path
        .clone()
        .ok_or("no database: pass --db or set storage.path")?;

    let log = Arc::new(RocksLog::open(&path, &config.storage)?);

    match cli.command {
        Command::List => {
            for doc in log.list_documents()? {
                println!(
                    "{}  v{:<6} {:>8} chars  {}{}",
                    doc.id,
                    doc.version,
                    doc.length,
                    doc.title,
                    if doc.is_public { "  (public)" } else { "" }
                );
            }
        }
        Command::Log { document, since } => {
            for entry in log.entries_since(document, since)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::Verify { document } => {
            let report = verify_document(log.as_ref(), document)?;
            if report.is_ok() {
                println!("{document}: {} entries, ok", report.entries);
            } else {
                for problem in &report.problems {
                    println!("{document}: {problem}");
                }
                return Ok(false);
            }
        }
        Command::Snapshot { document, rebuild } => {
            let snapshots = SnapshotManager::new(log.clone(), &config.snapshots);
            let snapshot = if rebuild {
                snapshots.rebuild(document)?
            } else {
                snapshots.snapshot(document)?
            };
            log::info!("Snapshot of {document} at version {}", snapshot.version);
            println!("{}", snapshot.content);
        }
    }

    log.flush()?;
    Ok(true)
}
