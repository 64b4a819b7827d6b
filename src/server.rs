//! HTTP/SSE API.
//!
//! The in-process boundary clients and channels go through:
//! - `POST /sessions` — allocate a session
//! - `POST /sessions/:id/turns` — submit a turn, `202` + turn id
//! - `GET  /sessions/:id/events` — SSE stream of typed turn events
//! - `POST /sessions/:id/commands` — `new` / `compact` / `info`
//! - `GET  /status` — runtime summary
//! - `GET  /healthz` — store + registry liveness

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::PithError;
use crate::events::TurnEvent;
use crate::runtime::{Runtime, RuntimeCommand};

/// Handle returned by [`start_server`].
pub struct Server {
    pub addr: SocketAddr,
    pub handle: JoinHandle<()>,
}

/// Bind the API listener and serve in a background task.
///
/// A bind failure is returned to the caller — startup treats it as fatal.
pub async fn start_server(addr: SocketAddr, runtime: Arc<Runtime>) -> std::io::Result<Server> {
    let app = router(runtime);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("api server error: {e}");
        }
    });

    info!(addr = %bound_addr, "api listening");
    Ok(Server {
        addr: bound_addr,
        handle,
    })
}

/// The API router (exposed for in-process tests).
pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:id/turns", post(submit_turn))
        .route("/sessions/:id/events", get(session_events))
        .route("/sessions/:id/commands", post(session_command))
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .with_state(runtime)
}

// ── handlers ─────────────────────────────────────────────────

async fn create_session(State(runtime): State<Arc<Runtime>>) -> Response {
    match runtime.new_session() {
        Ok(id) => (StatusCode::OK, Json(json!({ "session_id": id }))).into_response(),
        Err(e) => internal_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct TurnBody {
    text: String,
    #[serde(default)]
    deadline_seconds: Option<u64>,
}

async fn submit_turn(
    State(runtime): State<Arc<Runtime>>,
    Path(session_id): Path<String>,
    Json(body): Json<TurnBody>,
) -> Response {
    let permit = match runtime.begin_turn(&session_id) {
        Ok(p) => p,
        Err(PithError::Busy) => {
            return (
                StatusCode::CONFLICT,
                Json(json!({ "error": "busy", "detail": "session is running another turn" })),
            )
                .into_response();
        }
        Err(e) => return internal_error(&e),
    };

    let turn_id = permit.turn_id.clone();
    let deadline = body.deadline_seconds.map(Duration::from_secs);
    let rt = runtime.clone();
    let sid = session_id.clone();
    tokio::spawn(async move {
        rt.run_permitted_turn(permit, &sid, &body.text, deadline).await;
    });

    let mut response = (
        StatusCode::ACCEPTED,
        Json(json!({ "turn_id": turn_id })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&turn_id) {
        response.headers_mut().insert("x-pith-turn-id", value);
    }
    response
}

async fn session_events(
    State(runtime): State<Arc<Runtime>>,
    Path(session_id): Path<String>,
) -> Sse<impl futures_core::Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = runtime.bus().subscribe(&session_id);

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    yield Ok(SseEvent::default()
                        .event(envelope.event.name())
                        .data(serde_json::to_string(&envelope).unwrap_or_default()));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    // Slow subscribers are dropped, never back-pressured:
                    // announce the gap, then end the stream so the client
                    // reconnects for a fresh cursor.
                    let event = TurnEvent::SubscriberLagged { missed };
                    yield Ok(SseEvent::default()
                        .event(event.name())
                        .data(serde_json::to_string(&event).unwrap_or_default()));
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    cmd: String,
}

async fn session_command(
    State(runtime): State<Arc<Runtime>>,
    Path(session_id): Path<String>,
    Json(body): Json<CommandBody>,
) -> Response {
    let Some(cmd) = RuntimeCommand::parse(&body.cmd) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown command: {}", body.cmd) })),
        )
            .into_response();
    };
    match runtime.run_command(&session_id, cmd).await {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(PithError::Busy) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "busy" })),
        )
            .into_response(),
        Err(e) => internal_error(&e),
    }
}

async fn status(State(runtime): State<Arc<Runtime>>) -> Response {
    match runtime.status() {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e) => internal_error(&e),
    }
}

async fn healthz(State(runtime): State<Arc<Runtime>>) -> Response {
    if runtime.store().healthcheck() && !runtime.registry().is_empty() {
        (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable" })),
        )
            .into_response()
    }
}

fn internal_error(e: &PithError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.kind_str(), "detail": e.to_string() })),
    )
        .into_response()
}
