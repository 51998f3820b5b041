use std::fmt::Write as _;

use anyhow::Context;
use snap_core::{dry_run, Estimate, ExperimentConfig};

use super::super::args::{EstimateArgs, Selection};
use crate::exit_codes::SUCCESS;

pub(crate) async fn run(args: EstimateArgs) -> anyhow::Result<i32> {
    print_estimate(&args.selection).await
}

/// Load the config, estimate, print the table to stdout.
pub(crate) async fn print_estimate(selection: &Selection) -> anyhow::Result<i32> {
    let config = ExperimentConfig::load(&selection.config)
        .with_context(|| format!("loading config {}", selection.config.display()))?;
    let estimate = dry_run(
        &config,
        selection.mode,
        selection.models(),
        selection.resume.as_deref(),
    )
    .await?;
    print!("{}", format_estimate(&config.name, &estimate));
    Ok(SUCCESS)
}

pub(crate) fn format_estimate(name: &str, est: &Estimate) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Experiment {name} ({} mode): {} conditions, {} calls, {} remaining",
        est.mode, est.conditions, est.total_calls, est.remaining_calls
    );
    let _ = writeln!(
        out,
        "{:<40} {:<12} {:>8} {:>10}",
        "MODEL", "TIER", "CALLS", "COST_USD"
    );
    for m in &est.models {
        let cost = m
            .cost_usd
            .map_or_else(|| "-".to_string(), |c| format!("{c:.4}"));
        let _ = writeln!(
            out,
            "{:<40} {:<12} {:>8} {:>10}",
            m.model,
            m.tier.as_deref().unwrap_or("-"),
            m.remaining_calls,
            cost
        );
    }
    let _ = writeln!(out, "Total: ${:.4}", est.total_cost_usd);
    if !est.unpriced.is_empty() {
        let _ = writeln!(out, "Unpriced models: {}", est.unpriced.join(", "));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use snap_core::{ModelEstimate, RunMode};

    #[test]
    fn table_lists_models_and_unpriced() {
        let est = Estimate {
            mode: RunMode::Full,
            conditions: 10,
            total_calls: 20,
            remaining_calls: 15,
            total_cost_usd: 0.75,
            models: vec![
                ModelEstimate {
                    model: "model-a".into(),
                    tier: Some("budget".into()),
                    calls: 10,
                    remaining_calls: 5,
                    cost_usd: Some(0.75),
                },
                ModelEstimate {
                    model: "model-b".into(),
                    tier: None,
                    calls: 10,
                    remaining_calls: 10,
                    cost_usd: None,
                },
            ],
            unpriced: vec!["model-b".into()],
        };
        let text = format_estimate("demo", &est);
        assert!(text.starts_with("Experiment demo (full mode): 10 conditions, 20 calls, 15 remaining"));
        assert!(text.contains("budget"));
        assert!(text.contains("0.7500"));
        assert!(text.contains("Total: $0.7500"));
        assert!(text.contains("Unpriced models: model-b"));
    }
}
