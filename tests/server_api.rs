//! Integration tests for the HTTP/SSE API surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pith::config::{Config, ModelConfig, RuntimeConfig, ServerConfig};
use pith::events::EventBus;
use pith::models::mock::{ScriptedModel, ScriptedStep};
use pith::models::ModelEvent;
use pith::runtime::Runtime;
use pith::store::Store;
use pith::tools::builtins::register_builtins;
use pith::tools::ToolRegistry;
use serde_json::{json, Value};
use tokio_stream::StreamExt as _;

struct Api {
    _dir: tempfile::TempDir,
    base: String,
    runtime: Arc<Runtime>,
    model: Arc<ScriptedModel>,
    _server: pith::server::Server,
}

async fn start_api(model: Arc<ScriptedModel>) -> Api {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();

    let cfg = Arc::new(Config {
        version: 1,
        runtime: RuntimeConfig {
            workspace_path: Some(workspace.to_string_lossy().to_string()),
            memory_db_path: Some(dir.path().join("memory.db").to_string_lossy().to_string()),
            log_dir: Some(dir.path().join("logs").to_string_lossy().to_string()),
            ..Default::default()
        },
        model: ModelConfig {
            provider: "scripted".into(),
            model: "test".into(),
            api_key_env: "UNUSED".into(),
            base_url: None,
            temperature: 0.0,
            timeout_seconds: 120,
        },
        server: ServerConfig::default(),
        mcp: Default::default(),
        channels: Default::default(),
    });

    let store = Arc::new(Store::open(&cfg.memory_db_path()).unwrap());
    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry, &cfg.runtime.tool).unwrap();
    let bus = Arc::new(EventBus::new(256));
    let runtime = Runtime::new(cfg, store, registry, model.clone(), bus);

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = pith::server::start_server(addr, runtime.clone())
        .await
        .unwrap();

    Api {
        _dir: dir,
        base: format!("http://{}", server.addr),
        runtime,
        model,
        _server: server,
    }
}

async fn create_session(api: &Api) -> String {
    let resp = reqwest::Client::new()
        .post(format!("{}/sessions", api.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    body["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn healthz_and_status_respond() {
    let api = start_api(ScriptedModel::replying("hi")).await;

    let resp = reqwest::get(format!("{}/healthz", api.base)).await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = reqwest::get(format!("{}/status", api.base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["bootstrap_complete"], false);
    assert_eq!(body["model"], "scripted");
    assert!(body["registry"]["builtin"].as_u64().unwrap() > 0);
    assert!(body["uptime_seconds"].is_u64());
}

#[tokio::test]
async fn turn_submission_returns_202_and_runs() {
    let api = start_api(ScriptedModel::replying("done!")).await;
    let sid = create_session(&api).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/sessions/{}/turns", api.base, sid))
        .json(&json!({"text": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let header_turn_id = resp
        .headers()
        .get("x-pith-turn-id")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["turn_id"].as_str().unwrap(), header_turn_id);

    // The spawned turn lands in the store.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let n = api.runtime.store().message_count(&sid).unwrap();
        if n == 2 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "turn never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn busy_session_returns_conflict() {
    let model = ScriptedModel::new(vec![
        ScriptedStep::Events(vec![ModelEvent::TextDelta("slow".into())]),
        ScriptedStep::Events(vec![ModelEvent::TextDelta("second".into())]),
    ]);
    model.set_delay_per_event(Duration::from_millis(500));
    let api = start_api(model).await;
    let sid = create_session(&api).await;
    let client = reqwest::Client::new();

    let first = client
        .post(format!("{}/sessions/{}/turns", api.base, sid))
        .json(&json!({"text": "one"}))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 202);

    let second = client
        .post(format!("{}/sessions/{}/turns", api.base, sid))
        .json(&json!({"text": "two"}))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 409);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["error"], "busy");
}

#[tokio::test]
async fn sse_stream_delivers_typed_events() {
    let api = start_api(ScriptedModel::replying("streamed reply")).await;
    let sid = create_session(&api).await;
    let client = reqwest::Client::new();

    let events_resp = client
        .get(format!("{}/sessions/{}/events", api.base, sid))
        .send()
        .await
        .unwrap();
    assert_eq!(events_resp.status(), 200);
    let mut stream = events_resp.bytes_stream();

    client
        .post(format!("{}/sessions/{}/turns", api.base, sid))
        .json(&json!({"text": "go"}))
        .send()
        .await
        .unwrap();

    let mut buf = String::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !buf.contains("turn_finished") {
        assert!(std::time::Instant::now() < deadline, "no turn_finished on SSE");
        if let Ok(Some(Ok(chunk))) =
            tokio::time::timeout(Duration::from_secs(1), stream.next()).await
        {
            buf.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    assert!(buf.contains("event: turn_started"));
    assert!(buf.contains("event: assistant_delta"));
    assert!(buf.contains("event: assistant_message"));
    assert!(buf.contains("streamed reply"));
    assert!(buf.contains("\"seq\":"));
}

// Scenario S4: /new leaves the old session untouched.
#[tokio::test]
async fn command_new_allocates_fresh_session() {
    let api = start_api(ScriptedModel::replying("first reply")).await;
    let sid = create_session(&api).await;
    let client = reqwest::Client::new();

    // Seed one turn so the old session has messages.
    client
        .post(format!("{}/sessions/{}/turns", api.base, sid))
        .json(&json!({"text": "seed"}))
        .send()
        .await
        .unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while api.runtime.store().message_count(&sid).unwrap() < 2 {
        assert!(std::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let resp = client
        .post(format!("{}/sessions/{}/commands", api.base, sid))
        .json(&json!({"cmd": "new"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let id2 = body["session_id"].as_str().unwrap().to_string();
    assert_ne!(id2, sid);

    let store = api.runtime.store();
    assert!(store.list_messages(&id2, None, None).unwrap().is_empty());
    assert_eq!(store.list_messages(&sid, None, None).unwrap().len(), 2);
}

#[tokio::test]
async fn command_info_and_unknown_command() {
    let api = start_api(ScriptedModel::replying("unused")).await;
    let sid = create_session(&api).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/sessions/{}/commands", api.base, sid))
        .json(&json!({"cmd": "info"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["session_id"], sid.as_str());
    assert_eq!(body["bootstrap_complete"], false);

    let resp = client
        .post(format!("{}/sessions/{}/commands", api.base, sid))
        .json(&json!({"cmd": "dance"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(api.model.call_count(), 0);
}
