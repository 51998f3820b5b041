use clap::{Parser, Subcommand};

pub mod cache;
pub mod run;
pub use cache::*;
pub use run::*;

#[derive(Parser)]
#[command(
    name = "snap",
    version,
    about = "Factorial LLM profiling experiments: run, estimate, resume"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute an experiment (or estimate it with --dry-run)
    Run(RunArgs),
    /// Print call and cost estimates without calling any model
    Estimate(EstimateArgs),
    /// Show progress recorded in a checkpoint
    Status(StatusArgs),
    /// Manage the persistent response cache
    Cache(CacheArgs),
    Version,
}
