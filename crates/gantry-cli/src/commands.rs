//! CLI command definitions.

use clap::{Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Scaffold a new graph definition
    Init {
        /// Graph definition directory
        #[arg(short, long, default_value = "gantry")]
        root: PathBuf,
    },

    /// Check that the graph definition loads and connects
    Validate {
        /// Graph definition directory
        #[arg(short, long, default_value = "gantry")]
        root: PathBuf,
    },

    /// Generate one phase and print it
    Show {
        /// Phase to generate, e.g. full_job_graph or target_job_set
        #[arg(default_value = "optimized_job_graph")]
        phase: String,

        /// Graph definition directory
        #[arg(short, long, default_value = "gantry")]
        root: PathBuf,

        /// Parameters file, or "defaults"; repeat to compare several runs
        #[arg(short, long, default_value = "defaults")]
        parameters: Vec<String>,

        /// Output format
        #[arg(long, value_enum, default_value = "labels")]
        format: ShowFormat,

        /// Only print jobs whose label matches the pattern
        #[arg(long)]
        jobs_regex: Option<String>,
    },

    /// Generate every phase and write the decision artifacts
    Decision {
        /// Graph definition directory
        #[arg(short, long, default_value = "gantry")]
        root: PathBuf,

        /// Parameters file, or "defaults"
        #[arg(short, long, default_value = "defaults")]
        parameters: String,

        /// Directory the artifacts are written to
        #[arg(short, long, default_value = "artifacts")]
        output_dir: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShowFormat {
    /// One job label per line
    Labels,
    /// Pretty-printed JSON
    Json,
    /// YAML document
    Yaml,
}
