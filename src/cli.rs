//! CLI definitions for convoy
//!
//! This module contains all CLI argument parsing structures using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "convoy",
    version,
    about = "Release batch orchestrator for service infrastructure",
    long_about = "Drives release batches through pre-production and production waves.\nState lives in PostgreSQL; chart installations go through pluggable drivers."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator (scanner plus one worker per active batch)
    Serve {
        /// Path to the configuration file
        #[arg(long, env = "CONVOY_CONFIG", default_value = "convoy.yaml")]
        config: PathBuf,
    },

    /// Create or update the database schema
    Provision {
        /// Path to the configuration file
        #[arg(long, env = "CONVOY_CONFIG", default_value = "convoy.yaml")]
        config: PathBuf,
    },

    /// Show a batch with its apps and deployments
    Status {
        /// Path to the configuration file
        #[arg(long, env = "CONVOY_CONFIG", default_value = "convoy.yaml")]
        config: PathBuf,

        /// Batch to inspect
        #[arg(long)]
        batch_id: i64,

        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: String,
    },
}
