//! End-to-end tests against an in-process gateway with a stub provider, so
//! no network or API key is needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use llm_gateway::canonical::{
    Block, CanonicalChunk, CanonicalRequest, CanonicalResponse, BlockStart, StopReason, TokenUsage,
};
use llm_gateway::config::RouteEntry;
use llm_gateway::providers::{CallPolicy, ChunkStream, ModelInfo, Provider};
use llm_gateway::router::{ModelRouter, ProviderRegistry};
use llm_gateway::storage::Outcome;
use llm_gateway::{AppState, StorageService};

struct StubProvider {
    name: String,
    calls: AtomicU32,
}

impl StubProvider {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> CallPolicy {
        CallPolicy {
            max_retries: 3,
            timeout: Duration::from_secs(5),
        }
    }

    async fn send(
        &self,
        model: &str,
        _req: &CanonicalRequest,
    ) -> llm_gateway::Result<CanonicalResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CanonicalResponse {
            id: "msg_stub1".to_string(),
            model: model.to_string(),
            blocks: vec![Block::Text {
                text: "Hello from the stub".to_string(),
            }],
            stop_reason: StopReason::EndTurn,
            raw_stop_reason: None,
            usage: TokenUsage {
                input_tokens: 9,
                output_tokens: 4,
            },
        })
    }

    async fn stream(
        &self,
        model: &str,
        _req: &CanonicalRequest,
    ) -> llm_gateway::Result<ChunkStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let chunks: Vec<llm_gateway::Result<CanonicalChunk>> = vec![
            Ok(CanonicalChunk::Start {
                id: "msg_stub1".to_string(),
                model: model.to_string(),
                input_tokens: 9,
            }),
            Ok(CanonicalChunk::BlockStart {
                index: 0,
                start: BlockStart::Text,
            }),
            Ok(CanonicalChunk::TextDelta {
                index: 0,
                text: "Hello".to_string(),
            }),
            Ok(CanonicalChunk::BlockStop { index: 0 }),
            Ok(CanonicalChunk::Finish {
                stop_reason: StopReason::EndTurn,
                raw_stop_reason: None,
                usage: TokenUsage {
                    input_tokens: 9,
                    output_tokens: 2,
                },
            }),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn list_models(&self) -> llm_gateway::Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            id: "stub-upstream-model".to_string(),
            owned_by: self.name.clone(),
        }])
    }
}

struct TestGateway {
    addr: std::net::SocketAddr,
    storage: StorageService,
    stub: Arc<StubProvider>,
}

async fn start_gateway() -> TestGateway {
    let stub = Arc::new(StubProvider::new("anthropic"));

    let mut registry = ProviderRegistry::new();
    registry.insert("anthropic".to_string(), stub.clone());

    let mut routes = HashMap::new();
    routes.insert(
        "claude-3-haiku".to_string(),
        RouteEntry {
            provider: "anthropic".to_string(),
            model: "claude-3-haiku-20240307".to_string(),
        },
    );
    routes.insert(
        "gpt-4o".to_string(),
        RouteEntry {
            provider: "anthropic".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
        },
    );

    let router = ModelRouter::new(registry, routes, "anthropic".to_string());
    let storage = StorageService::open_in_memory(Duration::from_secs(1800)).unwrap();

    let state = Arc::new(AppState {
        router: Arc::new(router),
        storage: storage.clone(),
    });

    let app = llm_gateway::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestGateway {
        addr,
        storage,
        stub,
    }
}

/// Recording is detached from the response path; poll briefly for it.
async fn wait_for_exchanges(storage: &StorageService, count: usize) -> Vec<llm_gateway::storage::Exchange> {
    for _ in 0..50 {
        let exchanges = storage.list_exchanges(None).await.unwrap();
        if exchanges.len() >= count {
            return exchanges;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {count} recorded exchanges");
}

#[tokio::test]
async fn test_health() {
    let gw = start_gateway().await;
    let resp = reqwest::get(format!("http://{}/health", gw.addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_anthropic_roundtrip_records_exchange() {
    let gw = start_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/v1/messages", gw.addr))
        .json(&serde_json::json!({
            "model": "claude-3-haiku",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hi"}],
            "metadata": {"user_id": "user_x_account_y_session_z"}
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["model"], "claude-3-haiku");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 9);
    assert_eq!(gw.stub.calls.load(Ordering::SeqCst), 1);

    let exchanges = wait_for_exchanges(&gw.storage, 1).await;
    assert_eq!(exchanges[0].provider, "anthropic");
    assert_eq!(exchanges[0].requested_model, "claude-3-haiku");
    assert_eq!(exchanges[0].upstream_model, "claude-3-haiku-20240307");
    assert_eq!(exchanges[0].outcome, Outcome::Success);
    assert_eq!(exchanges[0].correlation_key, "session:z");
}

#[tokio::test]
async fn test_openai_caller_gets_remapped_stop_reason() {
    // OpenAI-format caller, model mapped to the anthropic provider: the
    // upstream end_turn must come back as finish_reason "stop".
    let gw = start_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/v1/chat/completions", gw.addr))
        .json(&serde_json::json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "hi"}
            ]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello from the stub");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));

    let exchanges = wait_for_exchanges(&gw.storage, 1).await;
    assert_eq!(exchanges[0].provider, "anthropic");
    assert_eq!(exchanges[0].upstream_model, "claude-3-5-sonnet-20241022");
}

#[tokio::test]
async fn test_streaming_anthropic_sse() {
    let gw = start_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/v1/messages", gw.addr))
        .json(&serde_json::json!({
            "model": "claude-3-haiku",
            "max_tokens": 64,
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.contains("text/event-stream"));

    let body = resp.text().await.unwrap();
    for event in [
        "event: message_start",
        "event: content_block_start",
        "event: content_block_delta",
        "event: content_block_stop",
        "event: message_delta",
        "event: message_stop",
    ] {
        assert!(body.contains(event), "missing {event} in: {body}");
    }
    assert!(body.contains("claude-3-haiku"));

    let exchanges = wait_for_exchanges(&gw.storage, 1).await;
    assert_eq!(exchanges[0].outcome, Outcome::Success);
    assert_eq!(exchanges[0].usage.output_tokens, 2);
    assert!(exchanges[0].response_body.is_some());
}

#[tokio::test]
async fn test_streaming_openai_sse_ends_with_done() {
    let gw = start_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/v1/chat/completions", gw.addr))
        .json(&serde_json::json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("chat.completion.chunk"));
    assert!(body.contains("\"finish_reason\":\"stop\""));
    assert!(body.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn test_invalid_payload_is_client_error_in_caller_shape() {
    let gw = start_gateway().await;
    let client = reqwest::Client::new();

    // Empty message list violates the canonical invariant.
    let resp = client
        .post(format!("http://{}/v1/messages", gw.addr))
        .json(&serde_json::json!({
            "model": "claude-3-haiku",
            "max_tokens": 64,
            "messages": []
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(gw.stub.calls.load(Ordering::SeqCst), 0);

    // The failed request is still recorded, with no provider attributed.
    let exchanges = wait_for_exchanges(&gw.storage, 1).await;
    assert_eq!(exchanges[0].outcome, Outcome::Error);
    assert_eq!(exchanges[0].provider, "");
}

#[tokio::test]
async fn test_models_endpoint_merges_catalog() {
    let gw = start_gateway().await;
    let resp = reqwest::get(format!("http://{}/v1/models", gw.addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"claude-3-haiku"));
    assert!(ids.contains(&"gpt-4o"));
    assert!(ids.contains(&"stub-upstream-model"));
}

#[tokio::test]
async fn test_monitoring_api_lifecycle() {
    let gw = start_gateway().await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        client
            .post(format!("http://{}/v1/messages", gw.addr))
            .json(&serde_json::json!({
                "model": "claude-3-haiku",
                "max_tokens": 64,
                "messages": [{"role": "user", "content": "hi"}],
                "metadata": {"user_id": "user_x_account_y_session_conv1"}
            }))
            .send()
            .await
            .unwrap();
    }
    wait_for_exchanges(&gw.storage, 2).await;

    let requests: serde_json::Value = client
        .get(format!("http://{}/api/requests", gw.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(requests.as_array().unwrap().len(), 2);

    let conversations: serde_json::Value = client
        .get(format!("http://{}/api/conversations", gw.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let conversations = conversations.as_array().unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0]["exchange_count"], 2);

    let conv_id = conversations[0]["id"].as_str().unwrap();
    let conversation: serde_json::Value = client
        .get(format!("http://{}/api/conversations/{conv_id}", gw.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(conversation["exchanges"].as_array().unwrap().len(), 2);

    // Bulk delete clears both surfaces.
    let deleted: serde_json::Value = client
        .delete(format!("http://{}/api/requests", gw.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deleted["deleted"], 2);

    let requests: serde_json::Value = client
        .get(format!("http://{}/api/requests", gw.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(requests.as_array().unwrap().is_empty());

    let conversations: serde_json::Value = client
        .get(format!("http://{}/api/conversations", gw.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(conversations.as_array().unwrap().is_empty());
}
