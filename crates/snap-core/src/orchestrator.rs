//! Run orchestration.
//!
//! A feeder task pushes work items into a bounded queue; a fixed pool of
//! worker tasks drains it through the [`Executor`] and sends outcomes back.
//! This task alone owns the [`CheckpointState`]: it converts outcomes to rows,
//! marks settled keys complete and persists per the [`CheckpointPolicy`].
//! The checkpoint is written once before any work starts; later save failures
//! are logged and the run keeps draining so paid-for results are returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cache::ResponseCache;
use crate::checkpoint::{self, CheckpointManager, CheckpointPolicy, CheckpointState};
use crate::clock::{Clock, SystemClock};
use crate::condition::{self, ExperimentDesign, RunMode, WorkItem};
use crate::config::ExperimentConfig;
use crate::errors::{SnapError, SnapResult};
use crate::estimate::{self, Estimate};
use crate::executor::{stopped, ExecutionOutcome, Executor};
use crate::parsing::ResponseParser;
use crate::prompt::PromptRenderer;
use crate::providers::llm::ChatTransport;
use crate::rate_limit::RateLimiter;
use crate::report::progress::{ProgressEvent, ProgressSink};
use crate::report::{ResultRow, RunArtifacts, RunSummary};

pub struct Orchestrator {
    executor: Executor,
    renderer: Arc<dyn PromptRenderer>,
    parser: Arc<dyn ResponseParser>,
    concurrency: usize,
    checkpoint_path: PathBuf,
    checkpoint_policy: CheckpointPolicy,
    progress: Option<ProgressSink>,
    stop: watch::Receiver<bool>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        executor: Executor,
        renderer: Arc<dyn PromptRenderer>,
        parser: Arc<dyn ResponseParser>,
        checkpoint_path: impl Into<PathBuf>,
    ) -> Self {
        let (_tx, stop) = watch::channel(false);
        Self {
            executor,
            renderer,
            parser,
            concurrency: 1,
            checkpoint_path: checkpoint_path.into(),
            checkpoint_policy: CheckpointPolicy::default(),
            progress: None,
            stop,
            clock: Arc::new(SystemClock),
        }
    }

    /// Wire limiter, cache and executor from `config`. The checkpoint goes to
    /// `<output_dir>/checkpoints/latest.json`.
    pub fn from_config(
        config: &ExperimentConfig,
        transport: Arc<dyn ChatTransport>,
        renderer: Arc<dyn PromptRenderer>,
        parser: Arc<dyn ResponseParser>,
        output_dir: &Path,
    ) -> SnapResult<Self> {
        let settings = &config.settings;
        let mut limiter = RateLimiter::new(settings.requests_per_minute, settings.burst)?;
        if let Some(adaptive) = settings.adaptive() {
            limiter = limiter.adaptive(adaptive)?;
        }

        let cache = config.cache.enabled.then(|| match &config.cache.dir {
            Some(dir) => ResponseCache::with_dir(dir, config.cache.ttl()),
            None => ResponseCache::in_memory(config.cache.ttl()),
        });

        let executor = Executor::new(
            transport,
            Arc::new(limiter),
            cache,
            settings.retry_policy(),
            settings.call_timeout(),
        );

        Ok(Self::new(
            executor,
            renderer,
            parser,
            checkpoint::default_path(output_dir),
        )
        .with_concurrency(settings.concurrency)
        .with_checkpoint_policy(settings.checkpoint_policy()))
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint_policy = policy;
        self
    }

    pub fn with_progress(mut self, sink: Option<ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Stop taking new work once `stop` turns true. Shared with the executor.
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.executor = self.executor.with_stop_signal(stop.clone());
        self.stop = stop;
        self
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    /// Execute every pending work item of `config.design` for `models`
    /// (`None`: all design models), resuming from `resume_from` if given.
    pub async fn run(
        &self,
        config: &ExperimentConfig,
        mode: RunMode,
        models: Option<&[String]>,
        resume_from: Option<&Path>,
    ) -> SnapResult<RunArtifacts> {
        config.validate()?;
        let design = &config.design;
        self.renderer.check(design)?;
        let models = select_models(design, models)?;

        let started_at = self.clock.now();
        let mut state = match resume_from {
            Some(path) => resume_state(path, &config.name, mode).await?,
            None => CheckpointState::new(&config.name, mode, config.to_value(), started_at),
        };
        let resumed = state.results.len();

        let work: Vec<WorkItem> = work_items(design, mode, &models)
            .filter(|item| !state.is_complete(item))
            .collect();
        let total = work.len();

        info!(
            experiment = %config.name,
            experiment_id = %state.experiment_id,
            mode = %mode,
            models = models.len(),
            work_items = total,
            resumed,
            concurrency = self.concurrency,
            "starting run"
        );

        // fail before any call is paid for if the checkpoint cannot be written
        let mut manager = CheckpointManager::new(&self.checkpoint_path, self.checkpoint_policy);
        manager.flush(&state).await.map_err(|e| {
            SnapError::checkpoint(&self.checkpoint_path, format!("not writable: {e}"))
        })?;
        let (job_tx, job_rx) = mpsc::channel::<WorkItem>(self.concurrency * 2);
        let (outcome_tx, mut outcome_rx) = mpsc::channel::<ExecutionOutcome>(self.concurrency * 2);

        let feeder = tokio::spawn(feed(work, job_tx, self.stop.clone()));

        let job_rx = Arc::new(Mutex::new(job_rx));
        let mut workers = JoinSet::new();
        for _ in 0..self.concurrency {
            workers.spawn(worker(
                self.executor.clone(),
                Arc::clone(&self.renderer),
                Arc::clone(&job_rx),
                outcome_tx.clone(),
                self.stop.clone(),
            ));
        }
        drop(outcome_tx);

        let mut pending_rows = Vec::new();
        let (mut done, mut cached, mut failed, mut transport_calls) = (0, 0, 0, 0usize);
        while let Some(outcome) = outcome_rx.recv().await {
            transport_calls += outcome.attempts as usize;
            let row = ResultRow::from_outcome(&outcome, self.parser.as_ref(), self.clock.now());

            done += 1;
            cached += usize::from(row.cached);
            failed += usize::from(!row.is_success());
            if let Some(sink) = &self.progress {
                sink(ProgressEvent {
                    done,
                    total,
                    cached,
                    failed,
                });
            }

            if row.is_final() {
                if state.mark_complete(row) {
                    if let Err(e) = manager.record(&state).await {
                        warn!(error = %e, "checkpoint save failed, continuing");
                    }
                }
            } else {
                pending_rows.push(row);
            }
        }

        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "worker task failed");
            }
        }
        if let Err(e) = feeder.await {
            warn!(error = %e, "feeder task failed");
        }

        if let Err(e) = manager.flush(&state).await {
            warn!(
                error = %e,
                path = %self.checkpoint_path.display(),
                "final checkpoint save failed"
            );
        }

        let interrupted = *self.stop.borrow();
        let not_started = total.saturating_sub(done);
        let mut results = state.results.clone();
        results.extend(pending_rows);
        results.sort_by(|a, b| a.key.cmp(&b.key));

        let mut summary = RunSummary::from_rows(&results, resumed, started_at, self.clock.now());
        summary.pending += not_started;
        summary.transport_calls = transport_calls;
        summary.interrupted = interrupted;

        info!(
            experiment = %config.name,
            executed = done,
            cached,
            failed,
            transport_calls,
            pending = summary.pending,
            interrupted,
            checkpoint_saves = manager.saves(),
            "run finished"
        );

        Ok(RunArtifacts {
            experiment_id: state.experiment_id,
            experiment_name: state.experiment_name,
            mode,
            results,
            summary,
        })
    }
}

/// Dry run: generation and cost estimate only. Reads `resume_from` to
/// discount completed work; never writes anything.
pub async fn dry_run(
    config: &ExperimentConfig,
    mode: RunMode,
    models: Option<&[String]>,
    resume_from: Option<&Path>,
) -> SnapResult<Estimate> {
    config.validate()?;
    let models = select_models(&config.design, models)?;
    let checkpoint = match resume_from {
        Some(path) => Some(resume_state(path, &config.name, mode).await?),
        None => None,
    };
    Ok(estimate::estimate(
        &config.design,
        mode,
        &models,
        &config.pricing,
        checkpoint.as_ref(),
    ))
}

/// Requested models in request order; every one must be part of the design.
pub fn select_models(
    design: &ExperimentDesign,
    requested: Option<&[String]>,
) -> SnapResult<Vec<String>> {
    let Some(requested) = requested.filter(|r| !r.is_empty()) else {
        return Ok(design.models.clone());
    };
    let mut selected = Vec::with_capacity(requested.len());
    for model in requested {
        if !design.models.contains(model) {
            return Err(SnapError::config(format!(
                "unknown model '{model}' (design has: {})",
                design.models.join(", ")
            )));
        }
        if !selected.contains(model) {
            selected.push(model.clone());
        }
    }
    Ok(selected)
}

/// Work items in generation order, model-major within each condition.
pub fn work_items<'a>(
    design: &'a ExperimentDesign,
    mode: RunMode,
    models: &'a [String],
) -> impl Iterator<Item = WorkItem> + 'a {
    condition::filter_for_mode(condition::generate(design), mode, design)
        .flat_map(move |c| models.iter().map(move |m| c.full_key(m)))
}

async fn resume_state(path: &Path, name: &str, mode: RunMode) -> SnapResult<CheckpointState> {
    let state = checkpoint::load(path)
        .await?
        .ok_or_else(|| SnapError::checkpoint(path, "checkpoint not found"))?;
    if state.experiment_name != name {
        return Err(SnapError::checkpoint(
            path,
            format!(
                "checkpoint belongs to experiment '{}', not '{}'",
                state.experiment_name, name
            ),
        ));
    }
    if state.mode != mode {
        warn!(
            checkpoint_mode = %state.mode,
            mode = %mode,
            "resuming checkpoint recorded in a different mode"
        );
    }
    Ok(state)
}

async fn feed(work: Vec<WorkItem>, tx: mpsc::Sender<WorkItem>, mut stop: watch::Receiver<bool>) {
    for item in work {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            sent = tx.send(item) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

async fn worker(
    executor: Executor,
    renderer: Arc<dyn PromptRenderer>,
    jobs: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    outcomes: mpsc::Sender<ExecutionOutcome>,
    stop: watch::Receiver<bool>,
) {
    loop {
        let next = jobs.lock().await.recv().await;
        let Some(item) = next else { break };
        if *stop.borrow() {
            break;
        }
        let messages = renderer.render(&item.condition);
        let outcome = executor.execute(item, messages).await;
        if outcomes.send(outcome).await.is_err() {
            break;
        }
    }
}
