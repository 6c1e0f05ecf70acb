//! Prints the chunks of ring-buffer snapshot files.
//!
//! A snapshot is whatever `RingBuffer::write_to_file` produced, typically a
//! flight-recorder ring dumped by a crashing daemon. Each chunk is shown as
//! a hex+ASCII dump. Exits non-zero if any file cannot be opened or parsed.

use clap::Parser;
use quickbeam_rb::{RbError, RbFlags, RingBuffer};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qb_blackbox", about = "Dump ring-buffer snapshot files")]
struct Args {
    /// Snapshot files written by the blackbox feature.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn hexdump(data: &[u8]) {
    for row in data.chunks(16) {
        let hex: Vec<String> = row.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = row
            .iter()
            .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
            .collect();
        println!("    {:<47} |{ascii}|", hex.join(" "));
    }
}

fn dump(path: &Path) -> Result<(), RbError> {
    let rb = RingBuffer::create_from_file(path, RbFlags::empty())?;
    println!("Dumping the contents of {}", path.display());
    println!(
        "  ring '{}': {} bytes of data, {} chunks",
        rb.name(),
        rb.data_size(),
        rb.chunks_used()
    );
    let mut index = 0u64;
    while let Some(chunk) = rb.chunk_peek(0)? {
        println!("  chunk {index}: {} bytes", chunk.len());
        hexdump(chunk);
        rb.chunk_reclaim()?;
        index += 1;
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let mut failed = false;
    for file in &args.files {
        if let Err(err) = dump(file) {
            eprintln!("qb_blackbox: {}: {err}", file.display());
            failed = true;
        }
    }
    if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}
