//! Experiment orchestration engine for factorial LLM profiling runs.
//!
//! Expands a declarative factorial design into work items (one API call per
//! model and condition), executes them concurrently against a chat-completion
//! provider under a shared rate limit, caches responses, retries transient
//! failures, and checkpoints progress so an interrupted run resumes without
//! repeating completed calls.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use snap_core::{
//!     ExperimentConfig, LikertParser, OpenRouterTransport, Orchestrator, RunMode,
//!     StimulusRenderer,
//! };
//!
//! # async fn example() -> snap_core::SnapResult<()> {
//! let config = ExperimentConfig::load(Path::new("snap.yaml"))?;
//! let transport = OpenRouterTransport::new(config.transport_config())?;
//! let renderer = StimulusRenderer::load(Path::new("stimuli.yaml"))?;
//!
//! let orchestrator = Orchestrator::from_config(
//!     &config,
//!     Arc::new(transport),
//!     Arc::new(renderer),
//!     Arc::new(LikertParser),
//!     Path::new("results"),
//! )?;
//! let artifacts = orchestrator.run(&config, RunMode::Pilot, None, None).await?;
//! snap_core::report::jsonl::write_artifacts(&artifacts, Path::new("results"))?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `SNAP_API_KEY` | Provider API key (falls back to `OPENROUTER_API_KEY`) |
//! | `SNAP_BASE_URL` | Endpoint base URL (default: `https://openrouter.ai/api/v1`) |
//! | `SNAP_CONCURRENCY` | Worker count (default: 5) |
//! | `SNAP_REQUESTS_PER_MINUTE` | Rate ceiling (default: 60) |

pub mod cache;
pub mod checkpoint;
pub mod clock;
pub mod condition;
pub mod config;
pub mod errors;
pub mod estimate;
pub mod executor;
pub mod orchestrator;
pub mod parsing;
pub mod prompt;
pub mod providers;
pub mod rate_limit;
pub mod report;

// Re-export main types
pub use cache::{fingerprint, ResponseCache};
pub use checkpoint::{CheckpointManager, CheckpointPolicy, CheckpointState};
pub use condition::{
    Condition, ConditionKey, ExperimentDesign, FullKey, RunMode, Temperature, WorkItem,
};
pub use config::{CacheConfig, ExperimentConfig, ProviderConfig, Settings};
pub use errors::{FailureKind, ProviderError, SnapError, SnapResult};
pub use estimate::{Estimate, ModelEstimate, PricingConfig};
pub use executor::{CallResult, ExecutionOutcome, Executor, RetryPolicy};
pub use orchestrator::{dry_run, Orchestrator};
pub use parsing::{LikertParser, ParseVerdict, RefusalCategory, ResponseParser};
pub use prompt::{ChatMessage, PromptRenderer, Role, StimulusRenderer, Stimuli};
pub use providers::llm::{ChatTransport, Completion, OpenRouterTransport, ScriptedTransport, Usage};
pub use rate_limit::{AdaptiveConfig, RateLimiter};
pub use report::{ResultRow, RunArtifacts, RunSummary};
