//! Result rows and run artifacts.

pub mod console;
pub mod jsonl;
pub mod progress;
pub mod summary;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::{FullKey, RunMode};
use crate::errors::FailureKind;
use crate::executor::{CallResult, ExecutionOutcome};
use crate::parsing::{ParseVerdict, RefusalCategory, ResponseParser, LIKERT_MAX, LIKERT_MIN};

pub use summary::RunSummary;

/// One row of the result table: one full key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    #[serde(flatten)]
    pub key: FullKey,
    pub raw_response: Option<String>,
    pub score: Option<u8>,
    pub score_valid: bool,
    pub is_refusal: bool,
    pub refusal_category: Option<RefusalCategory>,
    /// `score`, `refusal` or `unparseable`; null when the call failed.
    pub verdict: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub failure_message: Option<String>,
    pub retries: u32,
    pub latency_ms: u64,
    pub cached: bool,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub fingerprint: String,
    pub recorded_at: DateTime<Utc>,
}

impl ResultRow {
    /// Build a row, running `parser` over successful replies.
    pub fn from_outcome(
        outcome: &ExecutionOutcome,
        parser: &dyn ResponseParser,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let mut row = Self {
            key: outcome.work_item.clone(),
            raw_response: None,
            score: None,
            score_valid: false,
            is_refusal: false,
            refusal_category: None,
            verdict: None,
            failure_kind: None,
            failure_message: None,
            retries: outcome.retries,
            latency_ms: u64::try_from(outcome.latency.as_millis()).unwrap_or(u64::MAX),
            cached: outcome.is_cached(),
            prompt_tokens: 0,
            completion_tokens: 0,
            fingerprint: outcome.fingerprint.clone(),
            recorded_at,
        };

        match &outcome.result {
            CallResult::Success { completion, .. } => {
                let verdict = parser.parse(&completion.text);
                row.score = verdict.score();
                row.score_valid = row
                    .score
                    .is_some_and(|s| (LIKERT_MIN..=LIKERT_MAX).contains(&s));
                if let ParseVerdict::Refusal { category } = verdict {
                    row.is_refusal = true;
                    row.refusal_category = Some(category);
                }
                row.verdict = Some(verdict.label().to_string());
                row.raw_response = Some(completion.text.clone());
                row.prompt_tokens = completion.usage.prompt_tokens;
                row.completion_tokens = completion.usage.completion_tokens;
            }
            CallResult::Failure { kind, message } => {
                row.failure_kind = Some(*kind);
                row.failure_message = Some(message.clone());
            }
        }
        row
    }

    pub fn is_success(&self) -> bool {
        self.failure_kind.is_none()
    }

    /// Row is settled: success or permanent failure.
    pub fn is_final(&self) -> bool {
        !matches!(self.failure_kind, Some(kind) if kind.is_transient())
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifacts {
    pub experiment_id: String,
    pub experiment_name: String,
    pub mode: RunMode,
    /// Resumed rows plus this run's rows, sorted by full key.
    pub results: Vec<ResultRow>,
    pub summary: RunSummary,
}
