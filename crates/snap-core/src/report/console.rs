//! Human-readable output on stderr.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::progress::{ProgressEvent, ProgressSink};
use super::RunSummary;

/// Format a single progress line. Deterministic, unit-testable.
#[must_use]
pub fn format_progress_line(ev: &ProgressEvent) -> String {
    let pct = if ev.total == 0 {
        100.0
    } else {
        ev.done as f64 * 100.0 / ev.total as f64
    };
    format!(
        "Progress {}/{} ({:.0}%) cached={} failed={}",
        ev.done, ev.total, pct, ev.cached, ev.failed
    )
}

/// Minimum interval between progress updates to avoid log spam.
const PROGRESS_MIN_INTERVAL_MS: u64 = 500;

/// For large runs, emit at most every this many work items (1% step).
pub(crate) fn progress_step(total: usize) -> usize {
    if total <= 100 {
        1
    } else {
        std::cmp::max(1, total / 100)
    }
}

struct ThrottleState {
    last_emit: Option<Instant>,
}

/// A sink that throttles updates and prints to stderr. Always emits on done == total.
pub fn default_progress_sink(total: usize) -> Option<ProgressSink> {
    if total <= 1 {
        return None;
    }
    let step = progress_step(total);
    let state = Arc::new(Mutex::new(ThrottleState { last_emit: None }));
    Some(Arc::new(move |ev: ProgressEvent| {
        if ev.total == 0 {
            return;
        }
        let now = Instant::now();
        let should_emit = {
            let mut g = state.lock().expect("progress throttle lock");
            let emit_final = ev.done == ev.total;
            let emit_step = ev.done % step == 0 || ev.done == 1;
            let interval_ok = g.last_emit.is_none_or(|t| {
                now.saturating_duration_since(t) >= Duration::from_millis(PROGRESS_MIN_INTERVAL_MS)
            });
            let ok = emit_final || (emit_step && interval_ok);
            if ok {
                g.last_emit = Some(now);
            }
            ok
        };
        if should_emit {
            eprintln!("{}", format_progress_line(&ev));
        }
    }))
}

pub fn print_summary(summary: &RunSummary) {
    eprintln!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    eprintln!(
        "Summary: {} rows, {} successful ({} valid, {} refusals, {} unparseable), {} failed, {} cached",
        summary.total,
        summary.successful,
        summary.valid_scores,
        summary.refusals,
        summary.unparseable,
        summary.failed,
        summary.cached
    );
    for (kind, n) in &summary.failures_by_kind {
        eprintln!("  {:<16} {}", kind.as_str(), n);
    }
    if summary.resumed > 0 {
        eprintln!("Resumed {} rows from checkpoint", summary.resumed);
    }
    if summary.pending > 0 {
        eprintln!(
            "{} work items failed transiently; resume from the checkpoint to retry them",
            summary.pending
        );
    }
    if summary.interrupted {
        eprintln!("Run interrupted; progress saved to checkpoint");
    }
}
