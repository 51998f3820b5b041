//! Full runs against a mocked OpenAI-compatible endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use snap_core::providers::llm::OpenRouterConfig;
use snap_core::{
    ExperimentConfig, FailureKind, LikertParser, OpenRouterTransport, Orchestrator, RunMode,
    StimulusRenderer, Stimuli,
};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CONFIG: &str = r#"
name: wire
design:
  models: [openai/gpt-4o-mini]
  items: { moral: [M01] }
  paraphrases: [P1]
  system_prompts: [NEU]
  temperatures: [0.7]
  contexts: { moral: [C0] }
  runs: 1
settings:
  concurrency: 1
  requests_per_minute: 600
  base_delay_ms: 10
  max_delay_ms: 50
  max_attempts: 3
cache:
  enabled: false
"#;

fn reply(text: &str) -> serde_json::Value {
    json!({
        "id": "gen-1",
        "model": "openai/gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 42, "completion_tokens": 3}
    })
}

fn renderer() -> Arc<StimulusRenderer> {
    Arc::new(StimulusRenderer::new(Stimuli {
        instruction: "Answer with a single number from 1 to 7.".into(),
        system_prompts: BTreeMap::from([("NEU".into(), "You are a survey respondent.".into())]),
        contexts: BTreeMap::from([("C0".into(), String::new())]),
        items: BTreeMap::from([(
            "M01".into(),
            BTreeMap::from([("P1".into(), "Lying is sometimes acceptable.".into())]),
        )]),
    }))
}

async fn run(server: &MockServer, output: &std::path::Path) -> snap_core::RunArtifacts {
    let config = ExperimentConfig::from_yaml(CONFIG).unwrap();
    let transport = OpenRouterTransport::new(
        OpenRouterConfig::default()
            .with_base_url(server.uri())
            .with_api_key("test-key"),
    )
    .unwrap();
    Orchestrator::from_config(
        &config,
        Arc::new(transport),
        renderer(),
        Arc::new(LikertParser),
        output,
    )
    .unwrap()
    .run(&config, RunMode::Full, None, None)
    .await
    .unwrap()
}

#[tokio::test]
async fn test_429_then_success_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("Score: 6")))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let artifacts = run(&server, dir.path()).await;

    let row = &artifacts.results[0];
    assert_eq!(row.score, Some(6));
    assert_eq!(row.retries, 1);
    assert_eq!(row.prompt_tokens, 42);
    assert_eq!(artifacts.summary.transport_calls, 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_unauthorized_is_recorded_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"error": {"message": "bad key"}})),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let artifacts = run(&server, dir.path()).await;

    let row = &artifacts.results[0];
    assert_eq!(row.failure_kind, Some(FailureKind::Auth));
    assert_eq!(row.retries, 0);
    assert_eq!(artifacts.summary.failed, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_server_errors_exhaust_attempts_and_stay_pending() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let artifacts = run(&server, dir.path()).await;

    let row = &artifacts.results[0];
    assert_eq!(row.failure_kind, Some(FailureKind::Server));
    assert_eq!(row.retries, 2);
    assert_eq!(artifacts.summary.pending, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}
