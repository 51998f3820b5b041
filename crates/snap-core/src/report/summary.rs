//! `summary.json`: run counters for downstream analysis.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ResultRow;
use crate::errors::FailureKind;

/// Current schema version for summary.json
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub schema_version: u32,
    /// Rows in the result table.
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub failures_by_kind: BTreeMap<FailureKind, usize>,
    pub cached: usize,
    pub valid_scores: usize,
    pub refusals: usize,
    pub unparseable: usize,
    /// Rows resumed from a checkpoint rather than executed this run.
    pub resumed: usize,
    /// Work items that will be retried by a later resume.
    pub pending: usize,
    /// Network calls attempted this run, retries included.
    pub transport_calls: usize,
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn from_rows(
        rows: &[ResultRow],
        resumed: usize,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let mut summary = Self {
            schema_version: SCHEMA_VERSION,
            total: rows.len(),
            successful: 0,
            failed: 0,
            failures_by_kind: BTreeMap::new(),
            cached: 0,
            valid_scores: 0,
            refusals: 0,
            unparseable: 0,
            resumed,
            pending: 0,
            transport_calls: 0,
            interrupted: false,
            started_at,
            finished_at,
        };

        for row in rows {
            if row.cached {
                summary.cached += 1;
            }
            match row.failure_kind {
                None => {
                    summary.successful += 1;
                    if row.score_valid {
                        summary.valid_scores += 1;
                    } else if row.is_refusal {
                        summary.refusals += 1;
                    } else {
                        summary.unparseable += 1;
                    }
                }
                Some(kind) => {
                    summary.failed += 1;
                    *summary.failures_by_kind.entry(kind).or_default() += 1;
                    if kind.is_transient() {
                        summary.pending += 1;
                    }
                }
            }
        }
        summary
    }

    /// Share of rows that yielded a usable score.
    pub fn valid_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.valid_scores as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{generate, tests::sample_design};

    fn row(i: usize, failure: Option<FailureKind>, score: Option<u8>, refusal: bool) -> ResultRow {
        let design = sample_design();
        ResultRow {
            key: generate(&design).nth(i).unwrap().full_key("model-a"),
            raw_response: None,
            score,
            score_valid: score.is_some(),
            is_refusal: refusal,
            refusal_category: None,
            verdict: None,
            failure_kind: failure,
            failure_message: None,
            retries: 0,
            latency_ms: 0,
            cached: i == 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            fingerprint: String::new(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn counters_partition_rows() {
        let rows = vec![
            row(0, None, Some(5), false),
            row(1, None, None, true),
            row(2, None, None, false),
            row(3, Some(FailureKind::ContentPolicy), None, false),
            row(4, Some(FailureKind::RateLimit), None, false),
        ];
        let now = Utc::now();
        let s = RunSummary::from_rows(&rows, 1, now, now);
        assert_eq!(s.total, 5);
        assert_eq!(s.successful, 3);
        assert_eq!(s.failed, 2);
        assert_eq!(s.valid_scores + s.refusals + s.unparseable, s.successful);
        assert_eq!(s.failures_by_kind[&FailureKind::ContentPolicy], 1);
        assert_eq!(s.pending, 1);
        assert_eq!(s.cached, 1);
        assert_eq!(s.resumed, 1);
        assert!((s.valid_rate() - 0.2).abs() < f64::EPSILON);

        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["failures_by_kind"]["rate_limit"], 1);
    }
}
