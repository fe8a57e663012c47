//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Modbus TCP server exposing live measurements as a register map.
#[derive(Parser, Debug)]
#[command(name = "modbus-register-server", version = crate::VERSION, long_about = None)]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a server until interrupted
    Run {
        /// Server configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Measurement events to replay, one JSON object per line
        #[arg(short, long)]
        events: Option<PathBuf>,
    },

    /// Export server configurations to one CSV file
    ConfigExport {
        /// Server configurations (TOML), one instance each
        #[arg(short, long, required = true, num_args = 1..)]
        config: Vec<PathBuf>,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Import server configurations from CSV files into TOML files
    ConfigImport {
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,

        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Export persisted register values of a server to CSV
    Backup {
        /// SQLite database path
        #[arg(short, long)]
        database: PathBuf,

        #[arg(short, long)]
        server_id: String,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Import persisted register values of a server from CSV
    Restore {
        /// SQLite database path
        #[arg(short, long)]
        database: PathBuf,

        #[arg(short, long)]
        server_id: String,

        #[arg(short, long)]
        input: PathBuf,

        /// Delete the server's stored registers first
        #[arg(long)]
        replace: bool,
    },
}
