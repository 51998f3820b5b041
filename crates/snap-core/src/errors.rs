//! Error types for the orchestration engine.
//!
//! Two families live here:
//!
//! - [`SnapError`]: configuration/fatal errors. These abort a run before any
//!   work item executes.
//! - [`ProviderError`]: per-call transport failures. These never abort a run;
//!   the executor classifies them into a [`FailureKind`] that ends up as data
//!   in the result table.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fatal errors.
#[derive(Debug, thiserror::Error)]
pub enum SnapError {
    /// Configuration file missing, unreadable or malformed.
    #[error("config error: {message}")]
    Config { message: String },

    /// Design violates an invariant (empty factor, mismatched categories, ...).
    #[error("invalid design: {message}")]
    InvalidDesign { message: String },

    /// Checkpoint unreadable, corrupt, or from another experiment.
    #[error("checkpoint error ({path}): {message}")]
    Checkpoint { path: String, message: String },

    /// Persistent cache could not be read or written.
    #[error("cache error: {message}")]
    Cache { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SnapError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn invalid_design(message: impl Into<String>) -> Self {
        Self::InvalidDesign {
            message: message.into(),
        }
    }

    pub fn checkpoint(path: &Path, message: impl Into<String>) -> Self {
        Self::Checkpoint {
            path: path.display().to_string(),
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::InvalidDesign { .. } => 2,
            Self::Checkpoint { .. } => 3,
            Self::Cache { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

/// Result type for fatal-error paths.
pub type SnapResult<T> = Result<T, SnapError>;

/// Classification of a failed call, persisted in result rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimit,
    Timeout,
    Server,
    Network,
    /// Stop signal observed before another attempt could start.
    Interrupted,
    Auth,
    BadRequest,
    ContentPolicy,
}

impl FailureKind {
    /// Transient failures may succeed on retry; permanent ones will not.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Timeout | Self::Server | Self::Network | Self::Interrupted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Server => "server",
            Self::Network => "network",
            Self::Interrupted => "interrupted",
            Self::Auth => "auth",
            Self::BadRequest => "bad_request",
            Self::ContentPolicy => "content_policy",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited: retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request timeout: {message}")]
    Timeout { message: String },

    #[error("provider server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("unauthorized (status {status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("bad request (status {status}): {message}")]
    BadRequest { status: u16, message: String },

    #[error("content policy refusal: {message}")]
    ContentPolicy { message: String },
}

impl ProviderError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RateLimited { .. } => FailureKind::RateLimit,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Server { .. } => FailureKind::Server,
            Self::Network { .. } => FailureKind::Network,
            Self::Unauthorized { .. } => FailureKind::Auth,
            Self::BadRequest { .. } => FailureKind::BadRequest,
            Self::ContentPolicy { .. } => FailureKind::ContentPolicy,
        }
    }

    /// Whether the error is retryable.
    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Provider-suggested wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                message: err.to_string(),
            }
        } else {
            Self::Network {
                message: err.to_string(),
            }
        }
    }
}
