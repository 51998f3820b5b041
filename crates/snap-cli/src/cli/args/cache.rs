use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Clone, Debug)]
pub struct StatusArgs {
    /// Checkpoint file, e.g. results/checkpoints/latest.json
    pub checkpoint: PathBuf,
}

#[derive(Parser, Clone, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub cmd: CacheSub,
}

#[derive(Subcommand, Clone, Debug)]
pub enum CacheSub {
    /// Remove entries older than the configured TTL
    Purge {
        #[arg(long, default_value = "snap.yaml")]
        config: PathBuf,
    },
    /// Remove every entry
    Clear {
        #[arg(long, default_value = "snap.yaml")]
        config: PathBuf,
    },
}
