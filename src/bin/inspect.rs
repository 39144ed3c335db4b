//! Tessera Inspect Binary
//!
//! Prints the durable metadata table of a data directory and optionally
//! verifies the checksums of every checkpoint file it names.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tessera::storage::MetadataManager;
use tracing_subscriber::{fmt, EnvFilter};

/// Tessera data directory inspector
#[derive(Parser, Debug)]
#[command(name = "tessera-inspect")]
#[command(about = "Inspect the durable state of a Tessera data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./tessera_data")]
    data_dir: PathBuf,

    /// Open every checkpoint file and validate its checksums
    #[arg(long)]
    verify: bool,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tessera=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = Args::parse();
    tracing::info!("Tessera Inspect v{}", tessera::VERSION);

    if !args.data_dir.is_dir() {
        eprintln!("Not a directory: {}", args.data_dir.display());
        process::exit(1);
    }

    // Read only: the directory may belong to a live or crashed store
    let record = match MetadataManager::peek_current(&args.data_dir) {
        Ok(Some(record)) => record,
        Ok(None) => {
            println!("No metadata table in {}", args.data_dir.display());
            return;
        }
        Err(e) => {
            eprintln!("Failed to read metadata table: {}", e);
            process::exit(1);
        }
    };

    println!("checkpoint lsn: {}", record.checkpoint_lsn);
    println!("files:          {}", record.files.len());
    println!();
    println!(
        "{:>8}  {:<32} {:>10} {:>10} {:>10} {:>6} {:>12}",
        "id", "name", "total", "valid", "deleted", "ts", "bytes"
    );
    for file in &record.files {
        println!(
            "{:>8}  {:<32} {:>10} {:>10} {:>10} {:>6} {:>12}",
            file.file_id,
            file.file_name,
            file.total_entries,
            file.valid_entries,
            file.deleted_entries,
            file.logical_timestamp,
            file.size_bytes
        );
    }

    if !args.verify {
        return;
    }

    println!();
    let files = match MetadataManager::peek_files(&args.data_dir, &record) {
        Ok(files) => files,
        Err(e) => {
            eprintln!("Failed to open checkpoint files: {}", e);
            process::exit(1);
        }
    };

    let mut failures = 0;
    for file in &files {
        match file.verify() {
            Ok(()) => println!("ok      {}", file.name()),
            Err(e) => {
                failures += 1;
                println!("FAILED  {}: {}", file.name(), e);
            }
        }
    }

    if failures > 0 {
        eprintln!("{} file(s) failed verification", failures);
        process::exit(1);
    }
}
