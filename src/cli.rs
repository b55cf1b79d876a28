//! # CLI Module - Command Line Interface for the Scenario Pipeline
//!
//! Three subcommands cover the simulation workflow:
//!
//! ## `run`
//!
//! Loads one scenario directory (the four YAML documents), runs the full
//! tick loop and exports the history.
//!
//! ```bash
//! canalsim-rs run ./scenarios/reservoir_control --output-dir ./data/history --format csv
//! ```
//!
//! ## `batch`
//!
//! Discovers every scenario directory under a root (any subdirectory with
//! a `config.yml`) and runs them in parallel worker threads, one history
//! file per scenario.
//!
//! ```bash
//! canalsim-rs batch --input-dir ./scenarios --output-dir ./data/history --threads 4
//! ```
//!
//! ## `validate`
//!
//! Loads and wires a scenario without running it, reporting configuration
//! and topology errors with a nonzero exit code.
//!
//! ```bash
//! canalsim-rs validate ./scenarios/reservoir_control
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    /// Flat rows, one column per component state variable.
    Csv,
    /// Pretty-printed snapshot list.
    Json,
    /// Compact binary snapshot list.
    Bin,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Bin => "bin",
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single scenario directory and export its history
    Run {
        /// Scenario directory containing the four YAML documents
        scenario: PathBuf,

        /// Directory to write the history file into
        #[arg(short, long, default_value = "./data/history/")]
        output_dir: PathBuf,

        /// Export format for the history
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,
    },

    /// Run every scenario directory under a root, in parallel
    Batch {
        /// Root directory scanned for scenario subdirectories
        #[arg(short, long, default_value = "./scenarios/")]
        input_dir: PathBuf,

        /// Directory to write the history files into
        #[arg(short, long, default_value = "./data/history/")]
        output_dir: PathBuf,

        /// Number of worker threads
        #[arg(short, long, default_value_t = 4)]
        threads: usize,

        /// Export format for the histories
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,
    },

    /// Load and wire a scenario without running it
    Validate {
        /// Scenario directory containing the four YAML documents
        scenario: PathBuf,
    },
}
