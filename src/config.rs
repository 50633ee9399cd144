//! Configuration module.
//!
//! Defines the command-line interface for the toolchain using `clap`:
//! one binary with `link`, `exec` and `nm` subcommands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// A miniature object-file toolchain for FLE objects.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Link relocatable objects, archives and shared objects.
    Link {
        /// Input FLE files.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output file.
        #[arg(short, long, default_value = "a.out")]
        output: PathBuf,

        /// Produce a shared object instead of an executable.
        #[arg(long)]
        shared: bool,

        /// Entry point symbol (executables only).
        #[arg(short, long, default_value = "_start")]
        entry: String,
    },
    /// Load an executable and its dependencies and run it.
    Exec {
        /// The executable FLE file.
        file: PathBuf,
    },
    /// Dump an object's symbol table.
    Nm {
        /// The FLE file to inspect.
        file: PathBuf,
    },
}
