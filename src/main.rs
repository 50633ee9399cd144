//! Entry point for the fld toolchain.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Initialize tracing from `RUST_LOG` or the `--log-level` flag.
//! 3. Dispatch to link / exec / nm.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fld::config::{Cli, Command};
use fld::linker::{self, LinkOptions};
use fld::{format, loader, nm};

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command {
        Command::Link {
            inputs,
            output,
            shared,
            entry,
        } => {
            let mut parsed = Vec::new();
            for path in &inputs {
                parsed.push(
                    format::read(path)
                        .with_context(|| format!("failed to read input {}", path.display()))?,
                );
            }
            let options = if shared {
                LinkOptions::shared_object(&output.display().to_string())
            } else {
                LinkOptions {
                    output_name: output.display().to_string(),
                    shared: false,
                    entry_symbol: entry,
                }
            };
            let linked = linker::link(parsed, &options)?;
            format::write_object(&output, &linked)?;
            println!("linked {} input(s) into {}", inputs.len(), output.display());
            Ok(())
        }
        Command::Exec { file } => {
            let object = format::read_object(&file)?;
            loader::execute(object)
        }
        Command::Nm { file } => {
            let object = format::read_object(&file)?;
            nm::dump(&object, &mut std::io::stdout())
        }
    }
}
