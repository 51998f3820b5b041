//! Run progress events. The orchestrator emits done/total in completion
//! order; the console layer consumes them through a sink.

use std::sync::Arc;

/// One progress update: work items finished this run and the run's total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub done: usize,
    pub total: usize,
    pub cached: usize,
    pub failed: usize,
}

/// Called after every outcome. Implementations may throttle.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
