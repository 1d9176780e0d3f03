//! CLI entrypoint for the hugealloc harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hugealloc_core::{HugeConfig, JunkMode, log::to_jsonl};
use hugealloc_harness::{StressConfig, parse_seed, stress};

/// Stress and configuration tooling for hugealloc.
#[derive(Debug, Parser)]
#[command(name = "hugealloc-harness")]
#[command(about = "Stress and configuration harness for hugealloc")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the multi-threaded huge workload and print a JSON report.
    Stress {
        /// Worker threads.
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Operations per worker.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Seed, decimal or 0x-prefixed hex.
        #[arg(long, default_value = "0x5EED")]
        seed: String,
        /// Chunks reserved by the backing pool.
        #[arg(long, default_value_t = 1024)]
        pool_chunks: usize,
        /// Largest request, in chunks.
        #[arg(long, default_value_t = 4)]
        max_chunks: usize,
        /// Override lg_chunk from HUGEALLOC_CONF.
        #[arg(long)]
        lg_chunk: Option<u8>,
        /// Override the junk mode (off, alloc, free, full).
        #[arg(long)]
        junk: Option<String>,
        /// Lifecycle log output path (JSONL).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Report output path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration from HUGEALLOC_CONF as JSON.
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Stress {
            threads,
            ops,
            seed,
            pool_chunks,
            max_chunks,
            lg_chunk,
            junk,
            log,
            output,
        } => {
            let mut huge = HugeConfig::from_env()?;
            if let Some(lg) = lg_chunk {
                huge.lg_chunk = lg;
            }
            if let Some(mode) = junk.as_deref() {
                huge.junk = JunkMode::from_str_loose(mode);
            }
            let config = StressConfig {
                threads,
                ops,
                seed: parse_seed(&seed)?,
                pool_chunks,
                max_chunks_per_alloc: max_chunks,
                huge,
            };
            eprintln!(
                "Stressing {} threads x {} ops (seed {:#x}, lg_chunk {})...",
                config.threads, config.ops, config.seed, config.huge.lg_chunk
            );

            let (report, records) = stress::run(&config)?;
            let body = serde_json::to_string_pretty(&report)?;
            if let Some(path) = output {
                std::fs::write(&path, &body)?;
                eprintln!("Report written to {}", path.display());
            } else {
                println!("{body}");
            }

            if let Some(path) = log {
                std::fs::write(&path, to_jsonl(&records)?)?;
                eprintln!("{} log records written to {}", records.len(), path.display());
            }

            if report.fill_violations > 0 {
                return Err(format!("{} fill violations", report.fill_violations).into());
            }
        }
        Command::Config => {
            let config = HugeConfig::from_env()?;
            println!("{}", config.to_json()?);
        }
    }

    Ok(())
}
