//! Key database management.
//!
//! Every action runs inside one transaction: it either commits completely or,
//! on any error, rolls back and exits non-zero.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use keyrelay::{CredentialStore, SqliteBackend};

#[derive(Parser, Debug)]
#[command(name = "keydb")]
#[command(author, version, about = "Manage relay signing keys", long_about = None)]
struct Args {
    /// Key database filename.
    #[arg(long, global = true, default_value = "keys.db")]
    keydb: PathBuf,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "lower")]
enum Action {
    /// Create an empty database (no-op if it exists).
    Initialise,
    /// Show every valid record.
    List,
    /// Rewrite legacy 48-byte records in the current layout.
    Convert,
    #[command(allow_negative_numbers = true)]
    Add {
        port1: i32,
        port2: i32,
        name: String,
        passphrase: String,
    },
    #[command(allow_negative_numbers = true)]
    Remove { port2: i32 },
    #[command(allow_negative_numbers = true)]
    SetName { port2: i32, name: String },
    #[command(allow_negative_numbers = true)]
    SetPass { port2: i32, passphrase: String },
    #[command(allow_negative_numbers = true)]
    SetPort1 { port2: i32, port1: i32 },
    /// Clear the stored signing timestamp.
    #[command(allow_negative_numbers = true)]
    ResetTimestamp { port2: i32 },
}

fn run(args: Args) -> Result<()> {
    if let Action::Initialise = args.action {
        SqliteBackend::create(&args.keydb)
            .with_context(|| format!("failed to create {}", args.keydb.display()))?;
        println!("Initialised {}", args.keydb.display());
        return Ok(());
    }

    let backend = SqliteBackend::open(&args.keydb)?;
    let mut store = CredentialStore::new(backend);
    let mut txn = store.transaction()?;

    match args.action {
        Action::Initialise => {}
        Action::List => {
            for record in txn.list()? {
                println!("{}", record?);
            }
        }
        Action::Convert => {
            let converted = txn.convert_legacy()?;
            for record in &converted {
                println!("Converted ID {}", record.port2);
            }
            println!("Converted {} records", converted.len());
        }
        Action::Add { port1, port2, name, passphrase } => {
            let record = txn.add(port1, port2, &name, &passphrase)?;
            println!("Added {record}");
        }
        Action::Remove { port2 } => {
            let record = txn.remove(port2)?;
            println!("Removed {record}");
        }
        Action::SetName { port2, name } => {
            let record = txn.set_name(port2, &name)?;
            println!("Set name for {record}");
        }
        Action::SetPass { port2, passphrase } => {
            let record = txn.set_passphrase(port2, &passphrase)?;
            println!("Set passphrase for {record}");
        }
        Action::SetPort1 { port2, port1 } => {
            let record = txn.set_port1(port2, port1)?;
            println!("Set port1 for {record}");
        }
        Action::ResetTimestamp { port2 } => {
            let record = txn.reset_timestamp(port2)?;
            println!("Reset timestamp for {record}");
        }
    }

    txn.commit()?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
