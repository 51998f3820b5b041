//! Run and estimate command arguments.

use std::path::PathBuf;

use clap::{Args, Parser};
use snap_core::RunMode;

/// Which slice of the design to run.
#[derive(Args, Clone, Debug)]
pub struct Selection {
    #[arg(long, default_value = "snap.yaml")]
    pub config: PathBuf,

    /// pilot (first value of every factor) or full
    #[arg(long, default_value = "pilot")]
    pub mode: RunMode,

    /// Restrict to these models (comma-separated); must be in the design
    #[arg(long, value_delimiter = ',')]
    pub models: Vec<String>,

    /// Resume from this checkpoint, skipping completed work
    #[arg(long)]
    pub resume: Option<PathBuf>,
}

impl Selection {
    pub fn models(&self) -> Option<&[String]> {
        (!self.models.is_empty()).then_some(self.models.as_slice())
    }
}

#[derive(Parser, Clone, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: Selection,

    /// Stimulus texts (items, system prompts, contexts, instruction)
    #[arg(long, default_value = "stimuli.yaml")]
    pub stimuli: PathBuf,

    /// Results directory (results.jsonl, summary.json, checkpoints/)
    #[arg(long, default_value = "results")]
    pub output: PathBuf,

    /// Estimate only; no model is called and nothing is written
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Parser, Clone, Debug)]
pub struct EstimateArgs {
    #[command(flatten)]
    pub selection: Selection,
}
