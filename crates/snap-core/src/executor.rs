//! Request executor: one work item, start to finish.
//!
//! cache lookup -> rate limiter -> transport (per-call timeout) -> classify ->
//! retry or give up -> cache store. Per-call failures come back as data in the
//! [`ExecutionOutcome`]; nothing here aborts a run.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info_span, warn, Instrument};

use crate::cache::{fingerprint, ResponseCache};
use crate::condition::WorkItem;
use crate::errors::{FailureKind, ProviderError, SnapError, SnapResult};
use crate::prompt::ChatMessage;
use crate::providers::llm::{ChatTransport, Completion};
use crate::rate_limit::RateLimiter;

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.25
}

/// Backoff parameters. Pure data; no clock, no randomness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per work item, first call included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Proportional jitter: the delay is scaled by `1 + jitter * sample`,
    /// `sample` in `[-1, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> SnapResult<()> {
        if self.max_attempts == 0 {
            return Err(SnapError::config("max_attempts must be at least 1"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(SnapError::config("base_delay_ms exceeds max_delay_ms"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(SnapError::config("jitter must be within 0.0..=1.0"));
        }
        Ok(())
    }

    fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Un-jittered delay before retry number `retry` (1-based): base doubling, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(32);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor)).min(self.max_delay())
    }

    /// Delay before retry number `retry` after `error`.
    ///
    /// A provider `Retry-After` raises the delay to at least that value; the
    /// cap applies in every case.
    pub fn delay_for(&self, retry: u32, error: &ProviderError, sample: f64) -> Duration {
        let scale = (1.0 + self.jitter * sample.clamp(-1.0, 1.0)).max(0.0);
        let mut delay = self.backoff(retry).mul_f64(scale);
        if let Some(retry_after) = error.retry_after() {
            delay = delay.max(retry_after);
        }
        delay.min(self.max_delay())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Per-work-item retry state machine.
#[derive(Debug, Clone)]
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    attempts: u32,
    last_error: Option<ProviderError>,
}

impl<'a> RetryState<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn last_error(&self) -> Option<&ProviderError> {
        self.last_error.as_ref()
    }

    /// Record a failed attempt and decide what happens next.
    pub fn on_failure(&mut self, error: ProviderError, sample: f64) -> RetryDecision {
        let decision = if !error.is_transient() || self.attempts >= self.policy.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.policy.delay_for(self.attempts, &error, sample))
        };
        self.last_error = Some(error);
        decision
    }
}

/// How one work item ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    Success { completion: Completion, cached: bool },
    Failure { kind: FailureKind, message: String },
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub work_item: WorkItem,
    pub fingerprint: String,
    pub result: CallResult,
    /// Transport calls made; zero for cache hits and items stopped early.
    pub attempts: u32,
    /// Retries consumed (attempts minus one; zero for cache hits).
    pub retries: u32,
    /// Duration of the final transport call; zero for cache hits.
    pub latency: Duration,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.result, CallResult::Success { .. })
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.result, CallResult::Success { cached: true, .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.result {
            CallResult::Failure { kind, .. } => Some(*kind),
            CallResult::Success { .. } => None,
        }
    }

    /// Successes and permanent failures are final; transient failures are
    /// left for a later resume.
    pub fn is_final(&self) -> bool {
        !matches!(self.failure_kind(), Some(kind) if kind.is_transient())
    }
}

/// Resolves when the stop flag turns true; never resolves if the sender is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|s| *s).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Executes work items. Cheap to clone; clones share cache, limiter and transport.
#[derive(Clone)]
pub struct Executor {
    transport: Arc<dyn ChatTransport>,
    limiter: Arc<RateLimiter>,
    cache: Option<ResponseCache>,
    retry: RetryPolicy,
    call_timeout: Duration,
    stop: watch::Receiver<bool>,
}

impl Executor {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        limiter: Arc<RateLimiter>,
        cache: Option<ResponseCache>,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        // a sender that is dropped immediately: never stops
        let (_tx, stop) = watch::channel(false);
        Self {
            transport,
            limiter,
            cache,
            retry,
            call_timeout,
            stop,
        }
    }

    /// Observe `stop`: in-flight attempts finish, no new attempt starts.
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn execute(&self, work_item: WorkItem, messages: Vec<ChatMessage>) -> ExecutionOutcome {
        let fp = fingerprint(
            &work_item.model_id,
            &messages,
            work_item.condition.temperature,
            work_item.condition.run_number,
        );
        let span = info_span!(
            "snap.request",
            model = %work_item.model_id,
            item = %work_item.condition.item_id,
            run = work_item.condition.run_number,
            fingerprint = %fp.get(..12).unwrap_or(&fp),
            cached = tracing::field::Empty,
            attempts = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async move {
            let outcome = self.execute_inner(work_item, fp, &messages).await;
            let span = tracing::Span::current();
            span.record("cached", outcome.is_cached());
            span.record("attempts", outcome.attempts);
            span.record(
                "outcome",
                outcome.failure_kind().map_or("success", FailureKind::as_str),
            );
            outcome
        }
        .instrument(span)
        .await
    }

    async fn execute_inner(
        &self,
        work_item: WorkItem,
        fp: String,
        messages: &[ChatMessage],
    ) -> ExecutionOutcome {
        let outcome = |result, attempts: u32, latency| ExecutionOutcome {
            work_item: work_item.clone(),
            fingerprint: fp.clone(),
            result,
            attempts,
            retries: attempts.saturating_sub(1),
            latency,
        };

        if let Some(cache) = &self.cache {
            match cache.lookup(&fp).await {
                Ok(Some(completion)) => {
                    return outcome(
                        CallResult::Success {
                            completion,
                            cached: true,
                        },
                        0,
                        Duration::ZERO,
                    );
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "cache lookup failed, treating as miss"),
            }
        }

        let mut stop = self.stop.clone();
        let mut state = RetryState::new(&self.retry);
        loop {
            if *stop.borrow() {
                return outcome(interrupted(state.last_error()), state.attempts(), Duration::ZERO);
            }
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => {
                    return outcome(interrupted(state.last_error()), state.attempts(), Duration::ZERO);
                }
                _ = self.limiter.acquire() => {}
            }

            state.begin_attempt();
            let started = Instant::now();
            let result = match timeout(
                self.call_timeout,
                self.transport
                    .complete(&work_item.model_id, messages, work_item.condition.temperature),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    message: format!("no response within {:?}", self.call_timeout),
                }),
            };
            let latency = started.elapsed();

            let error = match result {
                Ok(completion) => {
                    self.limiter.on_success().await;
                    if let Some(cache) = &self.cache {
                        if let Err(e) = cache.store(&fp, &completion).await {
                            warn!(error = %e, "failed to store response in cache");
                        }
                    }
                    return outcome(
                        CallResult::Success {
                            completion,
                            cached: false,
                        },
                        state.attempts(),
                        latency,
                    );
                }
                Err(error) => error,
            };

            if error.kind() == FailureKind::RateLimit {
                self.limiter.on_rate_limited().await;
            }

            let sample = rand::thread_rng().gen_range(-1.0..=1.0);
            match state.on_failure(error.clone(), sample) {
                RetryDecision::GiveUp => {
                    debug!(error = %error, attempts = state.attempts(), "giving up");
                    return outcome(
                        CallResult::Failure {
                            kind: error.kind(),
                            message: error.to_string(),
                        },
                        state.attempts(),
                        latency,
                    );
                }
                RetryDecision::Retry(delay) => {
                    warn!(
                        error = %error,
                        attempt = state.attempts(),
                        max_attempts = self.retry.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        "retrying request"
                    );
                    tokio::select! {
                        biased;
                        _ = stopped(&mut stop) => {
                            return outcome(interrupted(state.last_error()), state.attempts(), latency);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

fn interrupted(last_error: Option<&ProviderError>) -> CallResult {
    CallResult::Failure {
        kind: FailureKind::Interrupted,
        message: match last_error {
            Some(e) => format!("stopped before retry (last error: {e})"),
            None => "stopped before first attempt".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{tests::sample_design, Condition};
    use crate::providers::llm::ScriptedTransport;
    use crate::rate_limit::AdaptiveConfig;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: 0.0,
        }
    }

    fn work_item() -> WorkItem {
        let design = sample_design();
        let condition: Condition = crate::condition::generate(&design).next().unwrap();
        condition.full_key("model-a")
    }

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::user("Rate: honesty matters.")]
    }

    fn executor(transport: Arc<ScriptedTransport>, cache: Option<ResponseCache>) -> Executor {
        Executor::new(
            transport,
            Arc::new(RateLimiter::new(6_000.0, 10).unwrap()),
            cache,
            policy(),
            Duration::from_secs(5),
        )
    }

    fn rate_limited() -> ProviderError {
        ProviderError::RateLimited { retry_after: None }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(4), Duration::from_millis(800));
        assert_eq!(p.backoff(5), Duration::from_millis(1_000));
        assert_eq!(p.backoff(60), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_is_proportional_and_retry_after_is_honoured_up_to_cap() {
        let p = RetryPolicy {
            jitter: 0.5,
            ..policy()
        };
        let err = rate_limited();
        assert_eq!(p.delay_for(2, &err, 1.0), Duration::from_millis(300));
        assert_eq!(p.delay_for(2, &err, -1.0), Duration::from_millis(100));

        let hinted = ProviderError::RateLimited {
            retry_after: Some(Duration::from_millis(700)),
        };
        assert_eq!(p.delay_for(1, &hinted, 0.0), Duration::from_millis(700));
        let far = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(p.delay_for(1, &far, 0.0), Duration::from_millis(1_000));
    }

    #[test]
    fn state_machine_retries_transient_until_ceiling() {
        let p = policy();
        let mut state = RetryState::new(&p);

        state.begin_attempt();
        assert_eq!(
            state.on_failure(rate_limited(), 0.0),
            RetryDecision::Retry(Duration::from_millis(100))
        );
        state.begin_attempt();
        assert_eq!(
            state.on_failure(
                ProviderError::Server {
                    status: 502,
                    message: "bad gateway".into()
                },
                0.0
            ),
            RetryDecision::Retry(Duration::from_millis(200))
        );
        state.begin_attempt();
        assert_eq!(state.on_failure(rate_limited(), 0.0), RetryDecision::GiveUp);
        assert_eq!(state.attempts(), 3);
        assert_eq!(state.retries(), 2);
        assert_eq!(state.last_error().map(|e| e.kind()), Some(FailureKind::RateLimit));
    }

    #[test]
    fn state_machine_gives_up_on_permanent_errors() {
        let p = policy();
        let mut state = RetryState::new(&p);
        state.begin_attempt();
        let decision = state.on_failure(
            ProviderError::ContentPolicy {
                message: "flagged".into(),
            },
            0.0,
        );
        assert_eq!(decision, RetryDecision::GiveUp);
        assert_eq!(state.attempts(), 1);
        assert_eq!(state.retries(), 0);
    }

    #[test]
    fn policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        let bad = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(bad.validate().is_err());
        let bad = RetryPolicy {
            jitter: 1.5,
            ..RetryPolicy::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_then_success_records_one_retry() {
        let transport = Arc::new(ScriptedTransport::always("Score: 5").then_fail(rate_limited()));
        let outcome = executor(transport.clone(), None)
            .execute(work_item(), messages())
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.retries, 1);
        assert_eq!(transport.calls(), 2);
        assert!(outcome.is_final());
    }

    #[tokio::test(start_paused = true)]
    async fn provider_rate_limit_slows_adaptive_limiter_until_recovered() {
        let limiter = Arc::new(
            RateLimiter::new(6_000.0, 10)
                .unwrap()
                .adaptive(AdaptiveConfig {
                    backoff_factor: 0.5,
                    min_rpm: 1.0,
                    recovery_window: 2,
                    recovery_step: 0.5,
                })
                .unwrap(),
        );
        let transport = Arc::new(ScriptedTransport::always("Score: 5").then_fail(rate_limited()));
        let exec = Executor::new(
            transport.clone(),
            Arc::clone(&limiter),
            None,
            policy(),
            Duration::from_secs(5),
        );

        let first = exec.execute(work_item(), messages()).await;
        assert!(first.is_success());
        assert_eq!(first.retries, 1);
        // halved by the 429; one success is not yet a full recovery window
        assert_eq!(limiter.current_rpm().await, 3_000.0);

        let second = exec.execute(work_item(), messages()).await;
        assert!(second.is_success());
        assert_eq!(limiter.current_rpm().await, 6_000.0);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn content_policy_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::failing(ProviderError::ContentPolicy {
            message: "flagged".into(),
        }));
        let outcome = executor(transport.clone(), None)
            .execute(work_item(), messages())
            .await;

        assert_eq!(outcome.failure_kind(), Some(FailureKind::ContentPolicy));
        assert_eq!(outcome.retries, 0);
        assert_eq!(transport.calls(), 1);
        assert!(outcome.is_final());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_failure_keeps_last_kind_and_is_not_final() {
        let transport = Arc::new(ScriptedTransport::failing(ProviderError::Server {
            status: 503,
            message: "unavailable".into(),
        }));
        let outcome = executor(transport.clone(), None)
            .execute(work_item(), messages())
            .await;

        assert_eq!(outcome.failure_kind(), Some(FailureKind::Server));
        assert_eq!(outcome.retries, 2);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(transport.calls(), 3);
        assert!(!outcome.is_final());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_and_is_retried() {
        let transport = Arc::new(
            ScriptedTransport::always("Score: 3").with_delay(Duration::from_secs(10)),
        );
        let outcome = executor(transport.clone(), None)
            .execute(work_item(), messages())
            .await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Timeout));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn cache_hit_skips_transport() {
        let cache = ResponseCache::in_memory(chrono::Duration::days(1));
        let transport = Arc::new(ScriptedTransport::always("Score: 6"));
        let exec = executor(transport.clone(), Some(cache.clone()));

        let first = exec.execute(work_item(), messages()).await;
        assert!(first.is_success() && !first.is_cached());
        let second = exec.execute(work_item(), messages()).await;
        assert!(second.is_cached());
        assert_eq!(second.latency, Duration::ZERO);
        assert_eq!(second.fingerprint, first.fingerprint);
        assert_eq!(transport.calls(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_interrupts_backoff() {
        let (tx, rx) = watch::channel(false);
        let transport = Arc::new(ScriptedTransport::failing(rate_limited()));
        let exec = Executor::new(
            transport.clone(),
            Arc::new(RateLimiter::new(6_000.0, 10).unwrap()),
            None,
            RetryPolicy {
                base_delay_ms: 10_000,
                max_delay_ms: 10_000,
                ..policy()
            },
            Duration::from_secs(5),
        )
        .with_stop_signal(rx);

        let handle = tokio::spawn(async move { exec.execute(work_item(), messages()).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        let outcome = handle.await.unwrap();

        assert_eq!(outcome.failure_kind(), Some(FailureKind::Interrupted));
        assert!(!outcome.is_final());
        assert_eq!(transport.calls(), 1);
    }
}
