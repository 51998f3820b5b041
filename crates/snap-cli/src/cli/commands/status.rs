use std::fmt::Write as _;

use snap_core::checkpoint::{self, CheckpointState};
use snap_core::SnapError;

use super::super::args::StatusArgs;
use crate::exit_codes::SUCCESS;

pub(crate) async fn run(args: StatusArgs) -> anyhow::Result<i32> {
    let state = checkpoint::load(&args.checkpoint)
        .await?
        .ok_or_else(|| SnapError::checkpoint(&args.checkpoint, "checkpoint not found"))?;
    print!("{}", format_status(&state));
    Ok(SUCCESS)
}

pub(crate) fn format_status(state: &CheckpointState) -> String {
    let p = state.progress();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Experiment {} [{}] ({} mode)",
        state.experiment_name, state.experiment_id, state.mode
    );
    let _ = writeln!(
        out,
        "Started {}, updated {}",
        state.started_at.to_rfc3339(),
        state.updated_at.to_rfc3339()
    );
    let _ = writeln!(out, "Completed:          {}", p.completed);
    let _ = writeln!(out, "  successes:        {}", p.successes);
    let _ = writeln!(out, "  valid scores:     {}", p.valid_scores);
    let _ = writeln!(out, "  cache hits:       {}", p.cached);
    let _ = writeln!(out, "  permanent errors: {}", p.permanent_failures);
    out
}
