use std::sync::Arc;

use anyhow::Context;
use snap_core::report::console::{default_progress_sink, print_summary};
use snap_core::report::jsonl::write_artifacts;
use snap_core::{
    dry_run, ExperimentConfig, LikertParser, OpenRouterTransport, Orchestrator, StimulusRenderer,
};
use tokio::sync::watch;
use tracing::warn;

use super::super::args::RunArgs;
use crate::exit_codes::{INCOMPLETE, SUCCESS};

pub(crate) async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let sel = &args.selection;
    if args.dry_run {
        return super::estimate::print_estimate(sel).await;
    }

    let config = ExperimentConfig::load(&sel.config)
        .with_context(|| format!("loading config {}", sel.config.display()))?;
    let renderer = StimulusRenderer::load(&args.stimuli)?;
    let transport = OpenRouterTransport::new(config.transport_config())?;

    let pending = dry_run(&config, sel.mode, sel.models(), sel.resume.as_deref()).await?;
    eprintln!(
        "Running {} ({} mode): {} of {} calls pending",
        config.name, sel.mode, pending.remaining_calls, pending.total_calls
    );
    let progress = default_progress_sink(usize::try_from(pending.remaining_calls)?);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight calls (press Ctrl-C again to abort)");
            let _ = stop_tx.send(true);
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });

    let orchestrator = Orchestrator::from_config(
        &config,
        Arc::new(transport),
        Arc::new(renderer),
        Arc::new(LikertParser),
        &args.output,
    )?
    .with_progress(progress)
    .with_stop_signal(stop_rx);

    let artifacts = orchestrator
        .run(&config, sel.mode, sel.models(), sel.resume.as_deref())
        .await?;
    let (results, summary) = write_artifacts(&artifacts, &args.output)
        .with_context(|| format!("writing results to {}", args.output.display()))?;

    print_summary(&artifacts.summary);
    eprintln!("Results: {}", results.display());
    eprintln!("Summary: {}", summary.display());
    eprintln!("Checkpoint: {}", orchestrator.checkpoint_path().display());

    let done = !artifacts.summary.interrupted && artifacts.summary.pending == 0;
    Ok(if done { SUCCESS } else { INCOMPLETE })
}
