//! OpenAI-compatible `/chat/completions` transport (OpenRouter by default).
//!
//! This is the only place that interprets HTTP status codes; everything
//! above it sees a classified [`ProviderError`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{ChatTransport, Completion, Usage};
use crate::condition::Temperature;
use crate::errors::{ProviderError, SnapError, SnapResult};
use crate::prompt::ChatMessage;

const USER_AGENT_VALUE: &str = concat!("snap/", env!("CARGO_PKG_VERSION"));

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_max_tokens() -> u32 {
    150
}

fn default_timeout() -> u64 {
    30
}

/// Transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token. Never serialized into checkpoints.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Connection-level timeout; the executor applies its own per-call timeout.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout(),
        }
    }
}

impl OpenRouterConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `SNAP_BASE_URL` | Endpoint base URL |
    /// | `SNAP_API_KEY` | API key (falls back to `OPENROUTER_API_KEY`) |
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("SNAP_BASE_URL").unwrap_or_else(|_| default_base_url()),
            api_key: std::env::var("SNAP_API_KEY")
                .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
                .ok(),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[derive(Debug, Clone)]
pub struct OpenRouterTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    max_tokens: u32,
}

impl OpenRouterTransport {
    pub fn new(config: OpenRouterConfig) -> SnapResult<Self> {
        let api_key = config
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                SnapError::config("missing API key (set SNAP_API_KEY or OPENROUTER_API_KEY)")
            })?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        default_headers.insert("x-title", HeaderValue::from_static("snap"));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(default_headers)
            .build()
            .map_err(|e| SnapError::config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl ChatTransport for OpenRouterTransport {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: Temperature,
    ) -> Result<Completion, ProviderError> {
        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature.as_f64(),
            "max_tokens": self.max_tokens,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        debug!(model, status, "chat completion response");

        match status {
            200..=299 => {
                // an unreadable 2xx body is usually a connection cut mid-transfer
                let json: Value = response.json().await.map_err(|e| ProviderError::Network {
                    message: format!("unreadable response body: {}", e),
                })?;
                parse_completion(model, status, &json)
            }

            429 => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(ProviderError::RateLimited { retry_after })
            }

            _ => {
                let message = response.text().await.unwrap_or_default();
                Err(classify_status(status, message))
            }
        }
    }

    fn provider_name(&self) -> &'static str {
        "openrouter"
    }
}

fn is_moderation(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("moderation") || lower.contains("flagged") || lower.contains("content_filter")
}

/// Map a non-success, non-429 status to an error.
fn classify_status(status: u16, message: String) -> ProviderError {
    match status {
        400..=499 if is_moderation(&message) => ProviderError::ContentPolicy { message },
        401 | 403 => ProviderError::Unauthorized { status, message },
        408 => ProviderError::Timeout { message },
        500..=599 => ProviderError::Server { status, message },
        _ => ProviderError::BadRequest { status, message },
    }
}

/// Extract the reply, honouring errors some providers embed in a 200 body.
fn parse_completion(model: &str, status: u16, json: &Value) -> Result<Completion, ProviderError> {
    if let Some(error) = json.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("provider error")
            .to_string();
        let code = error
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(500);
        return Err(match code {
            429 => ProviderError::RateLimited { retry_after: None },
            code => classify_status(code, message),
        });
    }

    let choice = json.pointer("/choices/0").ok_or_else(|| ProviderError::BadRequest {
        status,
        message: "response has no choices".to_string(),
    })?;

    if choice.get("finish_reason").and_then(Value::as_str) == Some("content_filter") {
        return Err(ProviderError::ContentPolicy {
            message: "finish_reason=content_filter".to_string(),
        });
    }

    let text = choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::BadRequest {
            status,
            message: "response missing message content".to_string(),
        })?
        .to_string();

    let tokens = |field: &str| {
        json.pointer(&format!("/usage/{field}"))
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };

    Ok(Completion {
        text,
        model: json
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_string(),
        usage: Usage {
            prompt_tokens: tokens("prompt_tokens"),
            completion_tokens: tokens("completion_tokens"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(server: &MockServer) -> OpenRouterTransport {
        let config = OpenRouterConfig::default()
            .with_base_url(server.uri())
            .with_api_key("test-key");
        OpenRouterTransport::new(config).expect("failed to create transport")
    }

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::user("Rate: lying is wrong.")]
    }

    fn t0() -> Temperature {
        Temperature::new(0.0).unwrap()
    }

    async fn call_with(template: ResponseTemplate) -> Result<Completion, ProviderError> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(template)
            .mount(&server)
            .await;
        transport(&server).complete("model-a", &messages(), t0()).await
    }

    #[tokio::test]
    async fn test_success_parses_text_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({"model": "model-a", "temperature": 0.0, "max_tokens": 150})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "vendor/model-a-2024",
                "choices": [{"message": {"role": "assistant", "content": "Score: 5"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 42, "completion_tokens": 4, "total_tokens": 46}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let completion = transport(&server)
            .complete("model-a", &messages(), t0())
            .await
            .expect("call failed");
        assert_eq!(completion.text, "Score: 5");
        assert_eq!(completion.model, "vendor/model-a-2024");
        assert_eq!(completion.usage.total(), 46);
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let err = call_with(ResponseTemplate::new(429).insert_header("retry-after", "5"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(5))
            }
        );
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let cases = [
            (500, FailureKind::Server),
            (503, FailureKind::Server),
            (408, FailureKind::Timeout),
            (401, FailureKind::Auth),
            (403, FailureKind::Auth),
            (400, FailureKind::BadRequest),
            (404, FailureKind::BadRequest),
        ];
        for (status, kind) in cases {
            let err = call_with(ResponseTemplate::new(status).set_body_string("nope"))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), kind, "status {status}");
        }
    }

    #[tokio::test]
    async fn test_content_policy_detection() {
        let err = call_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": ""}, "finish_reason": "content_filter"}]
        })))
        .await
        .unwrap_err();
        assert_eq!(err.kind(), FailureKind::ContentPolicy);

        let err = call_with(
            ResponseTemplate::new(403).set_body_string(r#"{"error":{"message":"Input was flagged by moderation"}}"#),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), FailureKind::ContentPolicy);
    }

    #[tokio::test]
    async fn test_error_embedded_in_ok_body() {
        let err = call_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": {"code": 502, "message": "upstream unavailable"}
        })))
        .await
        .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Server);

        let err = call_with(ResponseTemplate::new(200).set_body_json(json!({"id": "x"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::BadRequest);
    }

    #[tokio::test]
    async fn test_unreadable_ok_body_is_transient() {
        let err = call_with(ResponseTemplate::new(200).set_body_string("{\"choices\": [{\"mess"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Network);
        assert!(err.is_transient());
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let err = OpenRouterTransport::new(OpenRouterConfig::default()).unwrap_err();
        assert!(matches!(err, SnapError::Config { .. }));
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let config = OpenRouterConfig::default().with_api_key("secret");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
