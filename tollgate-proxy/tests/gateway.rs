//! End-to-end tests of the HTTP surface against a scripted upstream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use bytes::Bytes;
use futures::stream;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tollgate_core::{AdmissionConfig, MemoryStore, UsageLedger};
use tollgate_proxy::{
    build_router, AppState, ForwardRequest, Forwarded, Forwarder, ProxyConfig, ProxyError,
};
use tower::ServiceExt;

#[derive(Clone)]
enum Reply {
    Json(Value),
    Stream(Vec<&'static str>),
    Fail { status: u16, message: &'static str },
}

/// Upstream stand-in: answers chat calls with a fixed reply once the gate
/// lets it through, and records what it was sent.
struct ScriptedForwarder {
    reply: Reply,
    gate: Arc<Semaphore>,
    seen: Mutex<Vec<ForwardRequest>>,
}

impl ScriptedForwarder {
    fn new(reply: Reply) -> Arc<Self> {
        Self::gated(reply, Semaphore::MAX_PERMITS)
    }

    fn gated(reply: Reply, permits: usize) -> Arc<Self> {
        Arc::new(Self { reply, gate: Arc::new(Semaphore::new(permits)), seen: Mutex::new(Vec::new()) })
    }

    fn chat_bodies(&self) -> Vec<Value> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == "/v1/chat/completions")
            .filter_map(|r| r.body.clone())
            .collect()
    }
}

#[async_trait]
impl Forwarder for ScriptedForwarder {
    async fn forward(&self, request: ForwardRequest) -> Result<Forwarded, ProxyError> {
        self.seen.lock().unwrap().push(request.clone());

        if request.path == "/v1/models" {
            return Ok(Forwarded::Json {
                status: 200,
                body: json!({"object": "list", "data": [{"id": "llama3.2:3b", "object": "model"}]}),
            });
        }

        self.gate
            .acquire()
            .await
            .map_err(|e| ProxyError::Internal(e.to_string()))?
            .forget();

        match &self.reply {
            Reply::Json(body) => Ok(Forwarded::Json { status: 200, body: body.clone() }),
            Reply::Stream(chunks) => {
                let chunks: Vec<Result<Bytes, std::io::Error>> =
                    chunks.iter().copied().map(|c| Ok(Bytes::from_static(c.as_bytes()))).collect();
                Ok(Forwarded::Stream { status: 200, body: Box::pin(stream::iter(chunks)) })
            }
            Reply::Fail { status: 404, message } => {
                Err(ProxyError::ModelNotFound(message.to_string()))
            }
            Reply::Fail { status, message } => {
                Err(ProxyError::Upstream { status: *status, message: message.to_string() })
            }
        }
    }

    async fn health_check(&self) -> Result<(), ProxyError> {
        Ok(())
    }
}

fn completion(prompt: u64, completion: u64) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "llama3.2:3b",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hi!"}, "finish_reason": "stop"}],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion
        }
    })
}

fn gateway(forwarder: Arc<ScriptedForwarder>, admission: AdmissionConfig) -> (Router, Arc<AppState>) {
    let config = ProxyConfig { admission, ..Default::default() };
    let state =
        Arc::new(AppState::with_backends(config, forwarder, Arc::new(MemoryStore::new())));
    (build_router(state.clone()), state)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body)
}

fn json_body(bytes: &Bytes) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

fn post_json(uri: &str, key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {}", key));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {}", key));
    }
    builder.body(Body::empty()).unwrap()
}

fn chat(key: &str, stream: bool) -> Request<Body> {
    post_json(
        "/v1/chat/completions",
        Some(key),
        json!({
            "model": "llama3.2:3b",
            "messages": [{"role": "user", "content": "Hello"}],
            "stream": stream,
            "temperature": 0.3
        }),
    )
}

/// Create a user through the admin API; returns (id, api_key)
async fn create_user(app: &Router, name: &str) -> (String, String) {
    let (status, _, body) = send(app, post_json("/admin/users", None, json!({"name": name}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let body = json_body(&body);
    (body["id"].as_str().unwrap().to_string(), body["api_key"].as_str().unwrap().to_string())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_requests_without_valid_key_are_rejected() {
    let forwarder = ScriptedForwarder::new(Reply::Json(completion(1, 1)));
    let (app, _) = gateway(forwarder.clone(), AdmissionConfig::default());

    let request = post_json("/v1/chat/completions", None, json!({"model": "m", "messages": []}));
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(&body)["error"]["type"], "auth_error");
    assert_eq!(json_body(&body)["error"]["code"], 401);

    let (status, _, _) = send(&app, chat("sk-not-issued", false)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = send(&app, get("/v1/usage", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert!(forwarder.chat_bodies().is_empty());
}

#[tokio::test]
async fn test_chat_completion_records_usage() {
    let forwarder = ScriptedForwarder::new(Reply::Json(completion(12, 30)));
    let (app, state) = gateway(forwarder.clone(), AdmissionConfig::default());
    let (user_id, key) = create_user(&app, "alice").await;

    let (status, headers, body) = send(&app, chat(&key, false)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("x-queue-position").is_none());
    assert_eq!(json_body(&body), completion(12, 30));

    let forwarded = forwarder.chat_bodies();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0]["temperature"], json!(0.3));
    assert!(forwarded[0].get("stream_options").is_none());

    let (status, _, body) = send(&app, get("/v1/usage", Some(&key))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json_body(&body),
        json!({
            "user_id": user_id,
            "usage": [{
                "model": "llama3.2:3b",
                "prompt_tokens": 12,
                "completion_tokens": 30,
                "total_tokens": 42
            }]
        })
    );

    assert_eq!(state.queue.status().active, 0);
}

#[tokio::test]
async fn test_invalid_chat_bodies() {
    let forwarder = ScriptedForwarder::new(Reply::Json(completion(1, 1)));
    let (app, _) = gateway(forwarder.clone(), AdmissionConfig::default());
    let (_, key) = create_user(&app, "bob").await;

    let request = post_json(
        "/v1/chat/completions",
        Some(&key),
        json!({"messages": [{"role": "user", "content": "hi"}]}),
    );
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["error"]["type"], "invalid_request");
    assert_eq!(json_body(&body)["error"]["message"], "model and messages are required");

    let request = post_json("/v1/chat/completions", Some(&key), json!({"model": "m", "messages": []}));
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {}", key))
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["error"]["type"], "invalid_request");

    assert!(forwarder.chat_bodies().is_empty());
}

#[tokio::test]
async fn test_unfamiliar_message_shapes_are_forwarded() {
    let forwarder = ScriptedForwarder::new(Reply::Json(completion(3, 4)));
    let (app, _) = gateway(forwarder.clone(), AdmissionConfig::default());
    let (_, key) = create_user(&app, "bianca").await;

    let messages = json!([
        {"role": "developer", "content": "Reply in French."},
        {
            "role": "user",
            "content": [
                {"type": "text", "text": "Transcribe this"},
                {"type": "input_audio", "input_audio": {"data": "UklGRg==", "format": "wav"}}
            ]
        }
    ]);
    let request = post_json(
        "/v1/chat/completions",
        Some(&key),
        json!({"model": "llama3.2:3b", "messages": messages, "stream": null}),
    );
    let (status, headers, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "application/json");
    assert_eq!(json_body(&body), completion(3, 4));

    let forwarded = forwarder.chat_bodies();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0]["messages"], messages);
    assert!(forwarded[0].get("stream_options").is_none());
}

#[tokio::test]
async fn test_rate_limit_denies_before_admission() {
    let forwarder = ScriptedForwarder::new(Reply::Json(completion(5, 10)));
    let (app, state) = gateway(forwarder.clone(), AdmissionConfig::default());
    let (user_id, key) = create_user(&app, "carol").await;

    let limits = json!({"user_id": user_id, "tokens_per_minute": 10});
    let (status, _, _) = send(&app, post_json("/admin/limits", None, limits)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(&app, chat(&key, false)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&app, chat(&key, false)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(&body);
    assert_eq!(body["error"]["type"], "rate_limit_exceeded");
    assert_eq!(body["error"]["code"], 429);
    assert_eq!(
        body["error"]["message"],
        "Rate limit exceeded: tokens_per_minute (limit: 10, used: 15)"
    );

    assert_eq!(forwarder.chat_bodies().len(), 1);
    assert_eq!(state.queue.status().active, 0);

    // other routes are unaffected by the cap
    let (status, _, _) = send(&app, get("/v1/usage", Some(&key))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_streaming_passthrough_records_usage() {
    let chunks = vec![
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: {\"choices\":[],",
        "\"usage\":{\"prompt_tokens\":8,\"completion_tokens\":2,\"total_tokens\":10}}\n\n",
        "data: [DONE]\n\n",
    ];
    let expected: String = chunks.concat();

    let forwarder = ScriptedForwarder::new(Reply::Stream(chunks));
    let (app, state) = gateway(forwarder.clone(), AdmissionConfig::default());
    let (user_id, key) = create_user(&app, "dave").await;

    let (status, headers, body) = send(&app, chat(&key, true)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "text/event-stream");
    assert_eq!(headers["cache-control"], "no-cache");
    assert!(headers.get("x-queue-position").is_none());
    assert_eq!(body, expected.as_bytes());

    let forwarded = forwarder.chat_bodies();
    assert_eq!(forwarded[0]["stream"], json!(true));
    assert_eq!(forwarded[0]["stream_options"], json!({"include_usage": true}));

    // recording happens after the stream settles
    let ledger = state.ledger.clone();
    let mut recorded = 0;
    for _ in 0..200 {
        recorded = ledger.lifetime_tokens(&user_id).await.unwrap();
        if recorded > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(recorded, 10);

    let queue = state.queue.clone();
    wait_until(|| queue.status().active == 0).await;
}

fn usage_stream() -> Vec<&'static str> {
    vec![
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":1,\"total_tokens\":5}}\n\n",
        "data: [DONE]\n\n",
    ]
}

#[tokio::test]
async fn test_stream_slot_frees_before_client_reads() {
    let forwarder = ScriptedForwarder::new(Reply::Stream(usage_stream()));
    let (app, state) = gateway(forwarder, AdmissionConfig::new(1, 0));
    let (user_id, key) = create_user(&app, "judy").await;

    // keep the response but never poll its body
    let unread = app.clone().oneshot(chat(&key, true)).await.unwrap();
    assert_eq!(unread.status(), StatusCode::OK);

    let queue = state.queue.clone();
    wait_until(|| queue.status().active == 0).await;

    // with no queue depth, a second request only succeeds if the slot is free
    let (status, _, body) = send(&app, chat(&key, true)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, usage_stream().concat().as_bytes());

    let body = axum::body::to_bytes(unread.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, usage_stream().concat().as_bytes());

    let ledger = state.ledger.clone();
    let mut recorded = 0;
    for _ in 0..200 {
        recorded = ledger.lifetime_tokens(&user_id).await.unwrap();
        if recorded == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(recorded, 10);
}

#[tokio::test]
async fn test_queued_stream_carries_queue_position() {
    let forwarder = ScriptedForwarder::gated(Reply::Stream(usage_stream()), 0);
    let (app, state) = gateway(forwarder.clone(), AdmissionConfig::new(1, 1));
    let (_, key) = create_user(&app, "kim").await;

    let first = tokio::spawn(app.clone().oneshot(chat(&key, true)));
    let queue = state.queue.clone();
    wait_until(|| queue.status().active == 1).await;

    let second = tokio::spawn(app.clone().oneshot(chat(&key, true)));
    wait_until(|| queue.status().queued == 1).await;

    forwarder.gate.add_permits(2);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first.headers().get("x-queue-position").is_none());

    let second = second.await.unwrap().unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["content-type"], "text/event-stream");
    assert_eq!(second.headers()["x-queue-position"], "1");

    let body = axum::body::to_bytes(second.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, usage_stream().concat().as_bytes());

    wait_until(|| queue.status().active == 0).await;
}

#[tokio::test]
async fn test_queue_full_and_queue_position() {
    let forwarder = ScriptedForwarder::gated(Reply::Json(completion(1, 1)), 0);
    let (app, state) = gateway(forwarder.clone(), AdmissionConfig::new(1, 1));
    let (_, key) = create_user(&app, "erin").await;

    let first = tokio::spawn(app.clone().oneshot(chat(&key, false)));
    let queue = state.queue.clone();
    wait_until(|| queue.status().active == 1).await;

    let second = tokio::spawn(app.clone().oneshot(chat(&key, false)));
    wait_until(|| queue.status().queued == 1).await;

    let (status, _, body) = send(&app, chat(&key, false)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(&body);
    assert_eq!(body["error"]["type"], "rate_limit_exceeded");
    assert_eq!(body["error"]["message"], "Queue is full (1 pending requests)");

    let (status, _, body) = send(&app, get("/admin/queue", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json_body(&body),
        json!({"active": 1, "queued": 1, "maxConcurrency": 1, "maxQueueDepth": 1})
    );

    forwarder.gate.add_permits(2);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first.headers().get("x-queue-position").is_none());

    let second = second.await.unwrap().unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["x-queue-position"], "1");

    assert_eq!(state.queue.status().active, 0);
    assert_eq!(forwarder.chat_bodies().len(), 2);
}

#[tokio::test]
async fn test_upstream_failures_release_the_slot() {
    let forwarder =
        ScriptedForwarder::new(Reply::Fail { status: 500, message: "runner crashed" });
    let (app, state) = gateway(forwarder, AdmissionConfig::new(1, 0));
    let (user_id, key) = create_user(&app, "frank").await;

    for _ in 0..2 {
        let (status, _, body) = send(&app, chat(&key, false)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(&body)["error"]["type"], "upstream_error");
        assert_eq!(state.queue.status().active, 0);
    }
    assert_eq!(state.ledger.lifetime_tokens(&user_id).await.unwrap(), 0);

    let forwarder = ScriptedForwarder::new(Reply::Fail { status: 404, message: "model not found" });
    let (app, _) = gateway(forwarder, AdmissionConfig::default());
    let (_, key) = create_user(&app, "grace").await;

    let (status, _, body) = send(&app, chat(&key, false)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["error"]["type"], "model_not_found");
}

#[tokio::test]
async fn test_admin_routes() {
    let forwarder = ScriptedForwarder::new(Reply::Json(completion(1, 1)));
    let (app, _) = gateway(forwarder, AdmissionConfig::default());

    let (status, _, body) = send(&app, post_json("/admin/users", None, json!({"name": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["error"]["type"], "invalid_request");

    let (user_id, key) = create_user(&app, "heidi").await;
    assert!(key.starts_with("sk-"));

    let (status, _, _) =
        send(&app, post_json("/admin/limits", None, json!({"tokens_per_day": 5}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        &app,
        post_json("/admin/limits", None, json!({"user_id": user_id, "priority": 11})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) =
        send(&app, post_json("/admin/limits", None, json!({"user_id": "nobody"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["error"]["type"], "invalid_request");

    let uri = format!("/admin/limits/{}", user_id);
    let (status, _, body) = send(&app, get(&uri, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["error"]["type"], "invalid_request");

    let limits = json!({"user_id": user_id, "tokens_per_day": 5000, "priority": 9});
    let (status, _, saved) = send(&app, post_json("/admin/limits", None, limits)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, fetched) = send(&app, get(&uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&saved), json_body(&fetched));

    let fetched = json_body(&fetched);
    assert_eq!(fetched["priority"], 9);
    assert_eq!(fetched["tokens_per_day"], 5000);
    assert_eq!(fetched["tokens_per_minute"], Value::Null);
}

#[tokio::test]
async fn test_models_and_health() {
    let forwarder = ScriptedForwarder::new(Reply::Json(completion(1, 1)));
    let (app, _) = gateway(forwarder, AdmissionConfig::default());
    let (_, key) = create_user(&app, "ivan").await;

    let (status, _, body) = send(&app, get("/v1/models", Some(&key))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["data"][0]["id"], "llama3.2:3b");

    let (status, _, body) = send(&app, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["upstream_url"], "http://127.0.0.1:11434");
    assert_eq!(body["queue"]["maxConcurrency"], 2);

    let (status, _, _) = send(&app, get("/live", None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app, get("/ready", None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, _) = send(&app, get("/metrics/prometheus", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers["content-type"].to_str().unwrap().starts_with("text/plain"));
}
