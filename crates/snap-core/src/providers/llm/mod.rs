//! Model call transports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::condition::Temperature;
use crate::errors::ProviderError;
use crate::prompt::ChatMessage;

pub mod openrouter;
pub mod scripted;

pub use openrouter::{OpenRouterConfig, OpenRouterTransport};
pub use scripted::ScriptedTransport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A successful model reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// Model id reported by the provider (may differ from the requested alias).
    pub model: String,
    #[serde(default)]
    pub usage: Usage,
}

/// One chat completion call. Errors come back already classified.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: Temperature,
    ) -> Result<Completion, ProviderError>;

    fn provider_name(&self) -> &'static str;
}
