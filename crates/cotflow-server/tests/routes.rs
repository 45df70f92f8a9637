//! Route tests against the router with a scripted backend connector.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use cotflow_config::{BackendKind, Settings, StaticCredential};
use cotflow_core::{ChatError, ChatRequest, ChatToken, TokenStream};
use cotflow_engine::{BackendConnector, DefaultConnector};
use cotflow_llm::BackendClient;
use cotflow_server::{router, ServerState};
use futures::stream;
use serde_json::{json, Value};
use tower::ServiceExt;

struct ScriptedBackend {
    kind: BackendKind,
    tokens: Vec<ChatToken>,
    models: Result<Vec<String>, ChatError>,
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn send(&self, _request: &ChatRequest) -> Result<TokenStream, ChatError> {
        let items: Vec<Result<ChatToken, ChatError>> = self.tokens.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(items)))
    }

    async fn list_models(&self) -> Result<Vec<String>, ChatError> {
        self.models.clone()
    }
}

struct ScriptedConnector {
    tokens: Vec<ChatToken>,
    models: Result<Vec<String>, ChatError>,
}

impl BackendConnector for ScriptedConnector {
    fn connect(&self, kind: BackendKind) -> Result<Box<dyn BackendClient>, ChatError> {
        Ok(Box::new(ScriptedBackend { kind, tokens: self.tokens.clone(), models: self.models.clone() }))
    }

    fn default_model(&self, _kind: BackendKind) -> Option<String> {
        Some("scripted".into())
    }
}

fn scripted_state(models: Result<Vec<String>, ChatError>) -> Arc<ServerState> {
    let connector = ScriptedConnector {
        tokens: vec![
            ChatToken::reasoning("Look at the inputs."),
            ChatToken::reasoning("\n\nAdd them."),
            ChatToken::answer("4"),
            ChatToken::Done,
        ],
        models,
    };
    Arc::new(ServerState::new(Settings::default(), Arc::new(connector)))
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, String) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// `(event, data)` pairs from an SSE body.
fn sse_events(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter_map(|frame| {
            let mut event = None;
            let mut data = None;
            for line in frame.lines() {
                if let Some(name) = line.strip_prefix("event:") {
                    event = Some(name.trim().to_string());
                } else if let Some(payload) = line.strip_prefix("data:") {
                    data = serde_json::from_str(payload.trim()).ok();
                }
            }
            Some((event?, data?))
        })
        .collect()
}

#[tokio::test]
async fn health_is_ok() {
    let (status, body) = send(router(scripted_state(Ok(vec![]))), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn chat_streams_steps_then_answer_then_end() {
    let state = scripted_state(Ok(vec![]));
    let app = router(state.clone());

    let (status, body) = send(app.clone(), "POST", "/chat", Some(json!({"backend": "local", "message": "2+2?"}))).await;
    assert_eq!(status, StatusCode::OK);

    let events = sse_events(&body);
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["started", "step", "step", "answer", "end"]);

    assert_eq!(events[0].1["model"], "scripted");
    assert_eq!(events[1].1["preview"], "Look at the inpu…");
    assert_eq!(events[2].1["step"]["text"], "Add them.");
    assert_eq!(events[2].1["edge"], json!({"from": 1, "to": 2}));
    assert_eq!(events[3].1["delta"], "4");
    assert_eq!(events[4].1, json!({"outcome": {"status": "completed"}, "steps": 2, "answer_len": 1}));

    let (status, body) = send(app, "GET", "/conversation", None).await;
    assert_eq!(status, StatusCode::OK);
    let snapshot: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(snapshot["graph"]["nodes"].as_array().unwrap().len(), 2);
    assert_eq!(snapshot["answer"], "4");
}

#[tokio::test]
async fn back_to_back_turns_see_the_parked_conversation() {
    let state = scripted_state(Ok(vec![]));
    let app = router(state.clone());

    for message in ["first", "second"] {
        let (status, body) = send(app.clone(), "POST", "/chat", Some(json!({"backend": "local", "message": message}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sse_events(&body).last().map(|(name, _)| name.as_str()), Some("end"));

        assert!(!state.orchestrator.is_busy());
        let (status, body) = send(app.clone(), "GET", "/conversation", None).await;
        assert_eq!(status, StatusCode::OK);
        let snapshot: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(snapshot["outcome"]["status"], "completed");
    }
}

#[tokio::test]
async fn chat_accepts_backend_aliases() {
    let app = router(scripted_state(Ok(vec![])));
    let (status, _) = send(app, "POST", "/chat", Some(json!({"backend": "Ollama", "message": "hi"}))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn chat_rejects_unknown_backend_and_empty_message() {
    let app = router(scripted_state(Ok(vec![])));

    let (status, body) = send(app.clone(), "POST", "/chat", Some(json!({"backend": "gpt", "message": "hi"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("gpt"));

    let (status, _) = send(app, "POST", "/chat", Some(json!({"backend": "cloud", "message": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_while_busy_is_conflict() {
    let state = scripted_state(Ok(vec![]));
    let _permit = state.orchestrator.begin_turn().unwrap();

    let (status, body) = send(router(state), "POST", "/chat", Some(json!({"backend": "local", "message": "hi"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let error: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(error["kind"], "turn_in_progress");
}

#[tokio::test]
async fn cancel_without_turn_reports_false() {
    let (status, body) = send(router(scripted_state(Ok(vec![]))), "POST", "/chat/cancel", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"cancelled": false}));
}

#[tokio::test]
async fn missing_cloud_key_streams_auth_error() {
    let connector = DefaultConnector::new(Settings::default(), Arc::new(StaticCredential::none()));
    let state = Arc::new(ServerState::new(Settings::default(), Arc::new(connector)));

    let (status, body) = send(router(state), "POST", "/chat", Some(json!({"backend": "cloud", "message": "hi"}))).await;
    assert_eq!(status, StatusCode::OK);

    let events = sse_events(&body);
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["error", "end"]);
    assert_eq!(events[0].1["kind"], "auth");
    assert_eq!(events[1].1["outcome"]["status"], "failed");
}

#[tokio::test]
async fn local_models_are_listed_with_display_names() {
    let app = router(scripted_state(Ok(vec!["deepseek-r1:8b".into()])));

    let (status, body) = send(app.clone(), "GET", "/models/local", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_str::<Value>(&body).unwrap(),
        json!([{"id": "deepseek-r1:8b", "name": "Deepseek-r1:8b (Local)"}])
    );

    let (_, body) = send(app, "GET", "/init", None).await;
    let init: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(init["cloud_model"], "deepseek-reasoner");
    assert_eq!(init["local_models"][0]["id"], "deepseek-r1:8b");
    assert_eq!(init["backends"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn unavailable_local_server_is_503_but_init_still_works() {
    let app = router(scripted_state(Err(ChatError::BackendUnavailable("connection refused".into()))));

    let (status, body) = send(app.clone(), "GET", "/models/local", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("backend_unavailable"));

    let (status, body) = send(app, "GET", "/init", None).await;
    assert_eq!(status, StatusCode::OK);
    let init: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(init["local_models"], json!([]));
}
