//! Deterministic in-process transport for tests and offline demos.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ChatTransport, Completion, Usage};
use crate::condition::Temperature;
use crate::errors::ProviderError;
use crate::prompt::ChatMessage;

type Reply = Result<String, ProviderError>;

/// Replays queued replies in call order, then falls back to a default.
#[derive(Debug)]
pub struct ScriptedTransport {
    fallback: Reply,
    script: Mutex<VecDeque<Reply>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    /// Every call answers `text`.
    pub fn always(text: impl Into<String>) -> Self {
        Self::with_fallback(Ok(text.into()))
    }

    /// Every call fails with `error`.
    pub fn failing(error: ProviderError) -> Self {
        Self::with_fallback(Err(error))
    }

    fn with_fallback(fallback: Reply) -> Self {
        Self {
            fallback,
            script: Mutex::new(VecDeque::new()),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queue a reply ahead of the fallback.
    pub fn then_reply(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()))
    }

    /// Queue a failure ahead of the fallback.
    pub fn then_fail(self, error: ProviderError) -> Self {
        self.push(Err(error))
    }

    fn push(self, reply: Reply) -> Self {
        self.script
            .lock()
            .expect("scripted transport mutex poisoned")
            .push_back(reply);
        self
    }

    /// Simulated network latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _temperature: Temperature,
    ) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self
            .script
            .lock()
            .expect("scripted transport mutex poisoned")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let prompt_tokens = messages
            .iter()
            .map(|m| m.content.split_whitespace().count())
            .sum::<usize>();
        reply.map(|text| Completion {
            usage: Usage {
                prompt_tokens: u32::try_from(prompt_tokens).unwrap_or(u32::MAX),
                completion_tokens: u32::try_from(text.split_whitespace().count())
                    .unwrap_or(u32::MAX),
            },
            model: model.to_string(),
            text,
        })
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}
