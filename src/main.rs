//! vibestore admin tool - create a database or open and recover one

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use std::path::PathBuf;
use vibestore::database::{Database, DatabaseConfig};

/// vibestore admin tool
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base path; the database lives in PATH.db, PATH.log and PATH.xid
    path: PathBuf,

    /// Create a new database instead of opening an existing one
    #[arg(short, long)]
    create: bool,

    /// Page cache size in bytes
    #[arg(short, long, default_value_t = DatabaseConfig::default().memory)]
    memory: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = DatabaseConfig {
        memory: args.memory,
    };

    let db = if args.create {
        Database::create(&args.path, config)
            .with_context(|| format!("Failed to create database at {}", args.path.display()))?
    } else {
        Database::open(&args.path, config)
            .with_context(|| format!("Failed to open database at {}", args.path.display()))?
    };

    println!("Database: {}", args.path.display());
    println!("   - Pages: {}", db.dm().page_count());
    println!("   - Transactions issued: {}", db.tm().transaction_count());
    println!(
        "   - Active transactions: {}",
        db.tm().active_transactions().len()
    );

    db.close().context("Failed to close database")?;
    Ok(())
}
