use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "convcheck", version, about = "Model conversion accuracy checks")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Convert every model of a list and compare both runtimes
    Run {
        /// Model list file (`name,link[,mark,reason]` rows)
        #[arg(long)]
        list: PathBuf,

        /// Generic hub cache directory, cleared after every case
        #[arg(long, env = "TFHUB_CACHE_DIR")]
        hub_cache: Option<PathBuf>,

        /// Named hub cache directory, cleared after every case
        #[arg(long, env = "HF_HUB_CACHE")]
        hf_cache: Option<PathBuf>,

        /// Extra link substrings that mark frozen-graph archive storage
        #[arg(long = "storage-domain")]
        storage_domains: Vec<String>,

        /// Device for the target runtime (cpu or cuda:N)
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Log level (RUST_LOG)
        #[arg(long, default_value = "info")]
        log: String,
    },

    /// Check the attention operator over every mask/causal configuration
    Sdpa {
        /// Restrict to one float width (f32 or f64)
        #[arg(long)]
        dtype: Option<String>,

        /// Seed for inputs and masks
        #[arg(long)]
        seed: Option<u64>,

        /// Device for the target runtime (cpu or cuda:N)
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Log level (RUST_LOG)
        #[arg(long, default_value = "info")]
        log: String,
    },
}
