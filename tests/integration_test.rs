use anthropic_facade::config::ProxyConfig;
use anthropic_facade::journal::SharedJournal;
use anthropic_facade::translate::anthropic_types::*;
use anthropic_facade::translate::request::anthropic_to_openai;
use anthropic_facade::{build_router, AppState};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

type Received = Arc<Mutex<Vec<Value>>>;

// ────────────────────────────────────────────────────────────────
// Fake routing service
// ────────────────────────────────────────────────────────────────

fn text_completion() -> Value {
    json!({
        "id": "chatcmpl-text",
        "object": "chat.completion",
        "created": 1,
        "model": "gemini/gemini-2.5-pro",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hi"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 1, "total_tokens": 10}
    })
}

fn text_chunks() -> Vec<Value> {
    vec![
        json!({"id": "chatcmpl-text", "choices": [{"index": 0, "delta": {"role": "assistant", "content": "He"}}]}),
        json!({"id": "chatcmpl-text", "choices": [{"index": 0, "delta": {"content": "llo"}}]}),
        json!({"id": "chatcmpl-text", "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
        json!({"id": "chatcmpl-text", "choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}}),
    ]
}

fn tools_completion() -> Value {
    json!({
        "id": "chatcmpl-tools",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": "Let me check.",
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\": \"London\"}"}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 20, "completion_tokens": 7, "total_tokens": 27}
    })
}

fn tools_chunks() -> Vec<Value> {
    let tool = |id: Option<&str>, name: Option<&str>, args: &str| {
        let mut call = json!({"index": 0, "function": {"arguments": args}});
        if let Some(id) = id {
            call["id"] = json!(id);
            call["type"] = json!("function");
        }
        if let Some(name) = name {
            call["function"]["name"] = json!(name);
        }
        json!({"id": "chatcmpl-tools", "choices": [{"index": 0, "delta": {"tool_calls": [call]}}]})
    };

    vec![
        json!({"id": "chatcmpl-tools", "choices": [{"index": 0, "delta": {"content": "Let me "}}]}),
        json!({"id": "chatcmpl-tools", "choices": [{"index": 0, "delta": {"content": "check."}}]}),
        tool(Some("call_1"), Some("get_weather"), ""),
        tool(None, None, "{\"ci"),
        tool(None, None, "ty\": \"Lon"),
        tool(None, None, "don\"}"),
        json!({"id": "chatcmpl-tools", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        json!({"id": "chatcmpl-tools", "choices": [], "usage": {"prompt_tokens": 20, "completion_tokens": 7, "total_tokens": 27}}),
    ]
}

fn sse_body(chunks: &[Value], done: bool) -> Response {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    if done {
        body.push_str("data: [DONE]\n\n");
    }
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn fake_chat_completions(State(received): State<Received>, Json(body): Json<Value>) -> Response {
    received.lock().unwrap().push(body.clone());

    let model = body["model"].as_str().unwrap_or_default().to_string();
    let stream = body["stream"].as_bool().unwrap_or(false);

    match (model.as_str(), stream) {
        ("rate-limited", _) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": {"message": "Rate limit reached for requests", "type": "rate_limit_exceeded", "code": 429}})),
        )
            .into_response(),
        ("tools", false) => Json(tools_completion()).into_response(),
        ("tools", true) => sse_body(&tools_chunks(), true),
        ("broken", true) => sse_body(&text_chunks()[..1], false),
        (_, false) => Json(text_completion()).into_response(),
        (_, true) => sse_body(&text_chunks(), true),
    }
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct Harness {
    facade: SocketAddr,
    received: Received,
    client: reqwest::Client,
}

impl Harness {
    async fn start() -> Self {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let fake = Router::new()
            .route("/chat/completions", post(fake_chat_completions))
            .with_state(received.clone());
        let upstream = spawn(fake).await;

        Self::with_upstream(format!("http://{upstream}"), received).await
    }

    async fn with_upstream(base_url: String, received: Received) -> Self {
        let mut config = ProxyConfig::default();
        config.port = 0;
        config.upstream.base_url = base_url;
        config.upstream.api_key_env = "ANTHROPIC_FACADE_TEST_UNSET_KEY".to_string();
        config.models = HashMap::from([(
            "claude-sonnet-4-20250514".to_string(),
            "gemini/gemini-2.5-pro".to_string(),
        )]);

        let state = Arc::new(AppState {
            config,
            client: reqwest::Client::new(),
            journal: SharedJournal::in_memory(),
        });
        let facade = spawn(build_router(state)).await;

        Self {
            facade,
            received,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.facade, path)
    }

    async fn post_messages(&self, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url("/v1/messages"))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .unwrap()
    }

    fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }
}

fn messages_body(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "max_tokens": 64,
        "system": "You are terse.",
        "stream": stream,
        "messages": [{"role": "user", "content": "hello"}],
        "tools": [{
            "name": "get_weather",
            "description": "Current weather for a city",
            "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]}
        }]
    })
}

/// Split an SSE body into `(event, data)` pairs.
fn parse_sse(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter_map(|block| {
            let mut name = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(v) = line.strip_prefix("event:") {
                    name = Some(v.trim().to_string());
                } else if let Some(v) = line.strip_prefix("data:") {
                    data = Some(v.trim().to_string());
                }
            }
            Some((name?, serde_json::from_str(&data?).unwrap()))
        })
        .collect()
}

/// Rebuild the final message from a stream the way an Anthropic client would.
fn fold_stream(events: &[(String, Value)]) -> Value {
    let mut message = Value::Null;
    let mut blocks: Vec<Value> = Vec::new();
    let mut partial_json: HashMap<usize, String> = HashMap::new();

    for (name, data) in events {
        match name.as_str() {
            "message_start" => message = data["message"].clone(),
            "content_block_start" => {
                assert_eq!(data["index"].as_u64().unwrap() as usize, blocks.len());
                blocks.push(data["content_block"].clone());
            }
            "content_block_delta" => {
                let i = data["index"].as_u64().unwrap() as usize;
                let delta = &data["delta"];
                match delta["type"].as_str().unwrap() {
                    "text_delta" => {
                        let text = format!(
                            "{}{}",
                            blocks[i]["text"].as_str().unwrap(),
                            delta["text"].as_str().unwrap()
                        );
                        blocks[i]["text"] = json!(text);
                    }
                    "input_json_delta" => partial_json
                        .entry(i)
                        .or_default()
                        .push_str(delta["partial_json"].as_str().unwrap()),
                    other => panic!("Unexpected delta type {other}"),
                }
            }
            "content_block_stop" => {
                let i = data["index"].as_u64().unwrap() as usize;
                if let Some(raw) = partial_json.remove(&i) {
                    blocks[i]["input"] = serde_json::from_str(&raw).unwrap();
                }
            }
            "message_delta" => {
                message["stop_reason"] = data["delta"]["stop_reason"].clone();
                message["usage"]["output_tokens"] = data["usage"]["output_tokens"].clone();
                if let Some(input) = data["usage"].get("input_tokens") {
                    message["usage"]["input_tokens"] = input.clone();
                }
            }
            _ => {}
        }
    }

    message["content"] = json!(blocks);
    message
}

// ────────────────────────────────────────────────────────────────
// Translation through the public API
// ────────────────────────────────────────────────────────────────

#[test]
fn test_request_translation_with_model_alias() {
    let req: MessagesRequest =
        serde_json::from_value(messages_body("claude-sonnet-4-20250514", false)).unwrap();
    let mut config = ProxyConfig::default();
    config
        .models
        .insert("claude-sonnet-4-20250514".to_string(), "gpt-4o".to_string());

    let translated = anthropic_to_openai(&req, &config).unwrap();
    let wire = serde_json::to_value(&translated.value).unwrap();

    assert_eq!(wire["model"], "gpt-4o");
    assert_eq!(wire["messages"][0], json!({"role": "system", "content": "You are terse."}));
    assert_eq!(wire["messages"][1], json!({"role": "user", "content": "hello"}));
    assert_eq!(wire["tools"][0]["type"], "function");
    assert_eq!(wire["tools"][0]["function"]["name"], "get_weather");
    assert!(wire.get("stream_options").is_none());
}

// ────────────────────────────────────────────────────────────────
// End to end against a fake routing service
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_and_root() {
    let h = Harness::start().await;

    let health = h.client.get(h.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let root = h.client.get(h.url("/")).send().await.unwrap();
    assert!(root.text().await.unwrap().starts_with("anthropic-facade"));

    let models: Value = h
        .client
        .get(h.url("/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models["data"][0]["id"], "claude-sonnet-4-20250514");
    assert_eq!(models["data"][0]["routed_to"], "gemini/gemini-2.5-pro");
}

#[tokio::test]
async fn test_non_streaming_text_roundtrip() {
    let h = Harness::start().await;

    let resp = h
        .post_messages(&messages_body("claude-sonnet-4-20250514", false))
        .await;
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["model"], "claude-sonnet-4-20250514");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["content"], json!([{"type": "text", "text": "hi"}]));
    assert_eq!(body["usage"]["input_tokens"], 9);

    let received = h.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["model"], "gemini/gemini-2.5-pro");
    assert_eq!(received[0]["messages"].as_array().unwrap().len(), 2);
    assert_eq!(received[0]["max_tokens"], 64);
}

#[tokio::test]
async fn test_streaming_text_event_order() {
    let h = Harness::start().await;

    let resp = h
        .post_messages(&messages_body("claude-sonnet-4-20250514", true))
        .await;
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let events = parse_sse(&resp.text().await.unwrap());
    let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "ping",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    assert_eq!(events[0].1["message"]["model"], "claude-sonnet-4-20250514");
    assert_eq!(events[2].1["content_block"], json!({"type": "text", "text": ""}));
    assert_eq!(events[3].1["delta"], json!({"type": "text_delta", "text": "He"}));
    assert_eq!(events[4].1["delta"], json!({"type": "text_delta", "text": "llo"}));
    assert_eq!(events[6].1["delta"]["stop_reason"], "end_turn");
    assert_eq!(events[6].1["usage"]["output_tokens"], 2);

    let received = h.received();
    assert_eq!(received[0]["stream"], true);
    assert_eq!(received[0]["stream_options"]["include_usage"], true);
}

#[tokio::test]
async fn test_streamed_and_buffered_tool_use_agree() {
    let h = Harness::start().await;

    let buffered: Value = h
        .post_messages(&messages_body("tools", false))
        .await
        .json()
        .await
        .unwrap();

    let streamed_body = h
        .post_messages(&messages_body("tools", true))
        .await
        .text()
        .await
        .unwrap();
    let streamed = fold_stream(&parse_sse(&streamed_body));

    assert_eq!(buffered["stop_reason"], "tool_use");
    assert_eq!(
        buffered["content"][1],
        json!({"type": "tool_use", "id": "call_1", "name": "get_weather", "input": {"city": "London"}})
    );

    assert_eq!(streamed["id"], buffered["id"]);
    assert_eq!(streamed["content"], buffered["content"]);
    assert_eq!(streamed["stop_reason"], buffered["stop_reason"]);
    assert_eq!(streamed["usage"], buffered["usage"]);
}

#[tokio::test]
async fn test_upstream_error_is_mapped() {
    let h = Harness::start().await;

    let resp = h.post_messages(&messages_body("rate-limited", false)).await;
    assert_eq!(resp.status(), 429);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert_eq!(body["error"]["message"], "Rate limit reached for requests");
}

#[tokio::test]
async fn test_streaming_upstream_error_is_plain_json() {
    let h = Harness::start().await;

    let resp = h.post_messages(&messages_body("rate-limited", true)).await;
    assert_eq!(resp.status(), 429);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("application/json"));

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "rate_limit_error");
}

#[tokio::test]
async fn test_broken_stream_ends_with_error_then_message_stop() {
    let h = Harness::start().await;

    let resp = h.post_messages(&messages_body("broken", true)).await;
    assert_eq!(resp.status(), 200);

    let events = parse_sse(&resp.text().await.unwrap());
    let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        &names[names.len() - 4..],
        &["content_block_stop", "error", "message_delta", "message_stop"]
    );

    let (_, error) = &events[events.len() - 3];
    assert_eq!(error["type"], "error");
    assert_eq!(error["error"]["type"], "api_error");
    assert_eq!(events[events.len() - 2].1["delta"]["stop_reason"], "error");

    // The text that did arrive is kept.
    let folded = fold_stream(&events);
    assert_eq!(folded["content"][0]["text"], "He");
}

#[tokio::test]
async fn test_connection_refused_is_upstream_unavailable() {
    let unused = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let h = Harness::with_upstream(format!("http://{unused}"), Arc::default()).await;

    for stream in [false, true] {
        let resp = h
            .post_messages(&messages_body("claude-sonnet-4-20250514", stream))
            .await;
        assert_eq!(resp.status(), 502);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "api_error");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("upstream unavailable"));
    }
}

#[tokio::test]
async fn test_invalid_body_is_rejected_before_upstream() {
    let h = Harness::start().await;

    let resp = h
        .client
        .post(h.url("/v1/messages"))
        .header("Content-Type", "application/json")
        .body("{\"model\": \"x\"")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let mut bad_choice = messages_body("claude-sonnet-4-20250514", false);
    bad_choice["tool_choice"] = json!({"type": "tool", "name": "send_email"});
    let resp = h.post_messages(&bad_choice).await;
    assert_eq!(resp.status(), 400);

    assert!(h.received().is_empty());
}

#[tokio::test]
async fn test_dropped_parameters_show_up_in_diagnostics() {
    let h = Harness::start().await;

    let mut body = messages_body("claude-sonnet-4-20250514", false);
    body["top_k"] = json!(40);
    let resp = h.post_messages(&body).await;
    assert_eq!(resp.status(), 200);

    assert!(h.received()[0].get("top_k").is_none());

    let diagnostics: Value = h
        .client
        .get(h.url("/v1/diagnostics?limit=10"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = diagnostics["entries"].as_array().unwrap();
    assert!(entries.iter().any(|e| e["kind"] == "dropped_parameter"
        && e["message"].as_str().unwrap().contains("top_k")
        && e["request_id"].as_str().unwrap().starts_with("req_")));
}

#[tokio::test]
async fn test_count_tokens() {
    let h = Harness::start().await;

    let resp = h
        .client
        .post(h.url("/v1/messages/count_tokens"))
        .json(&json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{"role": "user", "content": "a".repeat(400)}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: CountTokensResponse = resp.json().await.unwrap();
    assert_eq!(body.input_tokens, 100);
    assert!(h.received().is_empty());
}
