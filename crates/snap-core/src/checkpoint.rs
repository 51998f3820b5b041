//! Durable run progress.
//!
//! A checkpoint records which full keys are settled (success or permanent
//! failure) together with their rows. Resume skips every key in the set, so
//! the set only ever grows. Saves are atomic: a sibling temp file is written,
//! fsynced, then renamed over the target.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::condition::{FullKey, RunMode};
use crate::errors::{SnapError, SnapResult};
use crate::report::ResultRow;

/// Checkpoint format version. Bumped on incompatible layout changes.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Conventional location under an output directory.
pub fn default_path(output_dir: &Path) -> PathBuf {
    output_dir.join("checkpoints").join("latest.json")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub version: u32,
    pub experiment_id: String,
    pub experiment_name: String,
    pub mode: RunMode,
    /// Configuration the run was started with.
    pub config: serde_json::Value,
    pub completed: BTreeSet<FullKey>,
    pub results: Vec<ResultRow>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counts for `snap status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointProgress {
    pub completed: usize,
    pub successes: usize,
    pub permanent_failures: usize,
    pub cached: usize,
    pub valid_scores: usize,
}

impl CheckpointState {
    pub fn new(
        experiment_name: impl Into<String>,
        mode: RunMode,
        config: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            experiment_id: uuid::Uuid::new_v4().to_string(),
            experiment_name: experiment_name.into(),
            mode,
            config,
            completed: BTreeSet::new(),
            results: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn is_complete(&self, key: &FullKey) -> bool {
        self.completed.contains(key)
    }

    /// Record a settled row. Returns `false` (and changes nothing) when the
    /// key is already complete.
    pub fn mark_complete(&mut self, row: ResultRow) -> bool {
        if !self.completed.insert(row.key.clone()) {
            return false;
        }
        self.updated_at = row.recorded_at.max(self.updated_at);
        self.results.push(row);
        true
    }

    pub fn progress(&self) -> CheckpointProgress {
        let successes = self.results.iter().filter(|r| r.is_success()).count();
        CheckpointProgress {
            completed: self.completed.len(),
            successes,
            permanent_failures: self.results.len() - successes,
            cached: self.results.iter().filter(|r| r.cached).count(),
            valid_scores: self.results.iter().filter(|r| r.score_valid).count(),
        }
    }
}

/// Load a checkpoint; `None` when the file does not exist.
pub async fn load(path: &Path) -> SnapResult<Option<CheckpointState>> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SnapError::checkpoint(path, format!("unreadable: {}", e))),
    };

    let value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| SnapError::checkpoint(path, format!("corrupt checkpoint: {}", e)))?;
    let version = value.get("version").and_then(serde_json::Value::as_u64);
    if version != Some(u64::from(CHECKPOINT_VERSION)) {
        return Err(SnapError::checkpoint(
            path,
            format!(
                "unsupported checkpoint version {:?} (expected {})",
                version, CHECKPOINT_VERSION
            ),
        ));
    }
    let state: CheckpointState = serde_json::from_value(value)
        .map_err(|e| SnapError::checkpoint(path, format!("corrupt checkpoint: {}", e)))?;

    debug!(path = %path.display(), completed = state.completed.len(), "loaded checkpoint");
    Ok(Some(state))
}

/// Atomically write `state` to `path`.
pub async fn save(state: &CheckpointState, path: &Path) -> SnapResult<()> {
    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| SnapError::checkpoint(path, format!("failed to serialize: {}", e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// When to persist: after `every_n` new outcomes or once `interval` has
/// elapsed since the last save, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    pub every_n: usize,
    pub interval: Duration,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            every_n: 10,
            interval: Duration::from_secs(60),
        }
    }
}

impl CheckpointPolicy {
    pub fn should_save(&self, unsaved: usize, since_last_save: Duration) -> bool {
        unsaved > 0 && (unsaved >= self.every_n.max(1) || since_last_save >= self.interval)
    }
}

/// Owns the checkpoint path and save cadence for one run.
#[derive(Debug)]
pub struct CheckpointManager {
    path: PathBuf,
    policy: CheckpointPolicy,
    unsaved: usize,
    last_save: Instant,
    saves: usize,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>, policy: CheckpointPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
            unsaved: 0,
            last_save: Instant::now(),
            saves: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn saves(&self) -> usize {
        self.saves
    }

    /// Count one new outcome; persist if the policy says so.
    pub async fn record(&mut self, state: &CheckpointState) -> SnapResult<bool> {
        self.unsaved += 1;
        if self.policy.should_save(self.unsaved, self.last_save.elapsed()) {
            self.flush(state).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Persist unconditionally.
    pub async fn flush(&mut self, state: &CheckpointState) -> SnapResult<()> {
        save(state, &self.path).await?;
        info!(
            path = %self.path.display(),
            completed = state.completed.len(),
            "checkpoint saved"
        );
        self.unsaved = 0;
        self.last_save = Instant::now();
        self.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{generate, tests::sample_design};
    use tempfile::TempDir;

    fn row(i: usize) -> ResultRow {
        let design = sample_design();
        ResultRow {
            key: generate(&design).nth(i).unwrap().full_key("model-a"),
            raw_response: Some("Score: 4".into()),
            score: Some(4),
            score_valid: true,
            is_refusal: false,
            refusal_category: None,
            verdict: Some("score".into()),
            failure_kind: None,
            failure_message: None,
            retries: 0,
            latency_ms: 12,
            cached: false,
            prompt_tokens: 10,
            completion_tokens: 2,
            fingerprint: "ab".repeat(32),
            recorded_at: Utc::now(),
        }
    }

    fn state() -> CheckpointState {
        CheckpointState::new(
            "snap-test",
            RunMode::Pilot,
            serde_json::json!({"name": "snap-test"}),
            Utc::now(),
        )
    }

    #[test]
    fn mark_complete_is_idempotent() {
        let mut s = state();
        assert!(s.mark_complete(row(0)));
        assert!(!s.mark_complete(row(0)));
        assert!(s.mark_complete(row(1)));
        assert_eq!(s.completed.len(), 2);
        assert_eq!(s.results.len(), 2);
        assert!(s.is_complete(&row(1).key));
        assert_eq!(s.progress().successes, 2);
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = TempDir::new().unwrap();
        let path = default_path(dir.path());
        let mut s = state();
        s.mark_complete(row(0));
        s.mark_complete(row(5));

        save(&s, &path).await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        let loaded = load(&path).await.unwrap().expect("checkpoint present");
        assert_eq!(loaded, s);
    }

    #[tokio::test]
    async fn missing_file_is_none_and_corrupt_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latest.json");
        assert!(load(&path).await.unwrap().is_none());

        std::fs::write(&path, "{\"version\": 1, \"completed\": ").unwrap();
        let err = load(&path).await.unwrap_err();
        assert!(matches!(err, SnapError::Checkpoint { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn incompatible_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latest.json");
        let mut value = serde_json::to_value(state()).unwrap();
        value["version"] = serde_json::json!(99);
        std::fs::write(&path, value.to_string()).unwrap();

        let err = load(&path).await.unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn policy_triggers_on_count_or_interval() {
        let p = CheckpointPolicy {
            every_n: 3,
            interval: Duration::from_secs(30),
        };
        assert!(!p.should_save(0, Duration::from_secs(300)));
        assert!(!p.should_save(2, Duration::from_secs(5)));
        assert!(p.should_save(3, Duration::from_secs(5)));
        assert!(p.should_save(1, Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn manager_saves_per_policy() {
        let dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(
            dir.path().join("cp.json"),
            CheckpointPolicy {
                every_n: 2,
                interval: Duration::from_secs(10),
            },
        );
        let s = state();
        assert!(!manager.record(&s).await.unwrap());
        assert!(manager.record(&s).await.unwrap());
        assert!(!manager.record(&s).await.unwrap());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(manager.record(&s).await.unwrap());
        assert_eq!(manager.saves(), 2);
        assert!(manager.path().exists());
    }
}
