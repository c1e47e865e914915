//! HTTP surface (C8). Grounded on `cognitod/src/api/mod.rs`'s axum
//! `Router`/`State<Arc<AppState>>` wiring (`all_routes`, `AppState`),
//! generalized from linnix's process/alert endpoints to the session/event/
//! metrics endpoints this tracer exposes, and on `ferrex-server`'s
//! `websocket_handler`/`handle_socket` pair for the `/ws` upgrade. CORS is
//! enriched from the pack via `tower-http`'s `CorsLayer`.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{CoreError, ManagerError};
use crate::hub::{BroadcastHub, Frame};
use crate::metrics::Metrics;
use crate::session::manager::SessionManager;
use crate::session::ScanFilter;
use taskscope_wire::Kind;

pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub hub: Arc<BroadcastHub>,
    pub metrics: Arc<Metrics>,
    /// Viewer config is opaque to the core; it is just a JSON blob this
    /// process reads and writes verbatim.
    pub viewer_config_path: PathBuf,
}

/// Maps the core's typed error kinds onto HTTP status codes: non-2xx for
/// scan/query failures, 400 for protocol errors, without mutating server
/// state.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        let status = match err {
            ManagerError::NotFound => StatusCode::NOT_FOUND,
            ManagerError::AlreadyExists | ManagerError::InUse => StatusCode::CONFLICT,
            ManagerError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
            ManagerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match err {
            CoreError::Protocol(_) | CoreError::InputValidation(_) => StatusCode::BAD_REQUEST,
            CoreError::Parse { .. } => StatusCode::OK, // partial results, not a failure
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/events", get(get_events))
        .route("/api/sessions/{id}/goroutines", get(get_goroutines))
        .route("/api/config", get(get_config).post(set_config))
        .route("/api/metrics", get(get_metrics))
        .route("/ws", get(ws_upgrade))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.list().await)
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let metadata = state.manager.metadata(&id).await?;
    Ok(Json(metadata))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    task_id: Option<u32>,
    kind: Option<u32>,
    ts_lower: Option<u64>,
    ts_upper: Option<u64>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn get_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = match query.kind {
        Some(raw) => Some(Kind::from_u32(raw).ok_or_else(|| {
            ApiError(
                StatusCode::BAD_REQUEST,
                format!("unknown event kind: {raw}"),
            )
        })?),
        None => None,
    };
    let filter = ScanFilter {
        task_id: query.task_id,
        kind,
        ts_lower: query.ts_lower,
        ts_upper: query.ts_upper,
        offset: query.offset.unwrap_or(0),
        limit: query.limit,
    };

    let store = state.manager.open(&id).await?;
    let outcome = store.scan(&filter).await?;
    Ok(Json(json!({
        "events": outcome.events,
        "truncated": outcome.truncation.is_some(),
        "truncation": outcome.truncation.map(|e| e.to_string()),
    })))
}

async fn get_goroutines(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.manager.open(&id).await?;
    let ids = store.unique_task_ids().await?;
    let mut ids: Vec<u32> = ids.into_iter().collect();
    ids.sort_unstable();
    Ok(Json(ids))
}

async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match tokio::fs::read_to_string(&state.viewer_config_path).await {
        Ok(contents) => match serde_json::from_str::<Value>(&contents) {
            Ok(value) => Json(value),
            Err(_) => Json(json!({})),
        },
        Err(_) => Json(json!({})),
    }
}

async fn set_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let encoded = serde_json::to_vec_pretty(&body)
        .map_err(|e| CoreError::protocol(format!("encode failure: {e}")))?;
    tokio::fs::write(&state.viewer_config_path, encoded)
        .await
        .map_err(CoreError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json((*state.metrics.snapshot()).clone())
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One live viewer: the hub's `Subscription` is a blocking handle (it backs
/// onto a `Condvar`, see [`crate::hub`]), so a dedicated bridging thread
/// drains it into a `tokio::sync::mpsc` channel the async websocket task can
/// await without blocking the runtime.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let subscription = state.hub.subscribe();
    let sub_id = subscription.id;
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let bridge = std::thread::Builder::new()
        .name(format!("taskscoped-ws-bridge-{sub_id}"))
        .spawn(move || loop {
            match subscription.recv_timeout(std::time::Duration::from_millis(500)) {
                Some(frame) => {
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
                None => {
                    if tx.is_closed() {
                        return;
                    }
                }
            }
        })
        .expect("failed to spawn websocket bridge thread");

    let (mut sender, mut receiver) = socket.split();
    let forward = async {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.to_json().into())).await.is_err() {
                break;
            }
        }
    };
    let drain_incoming = async {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => continue,
            }
        }
    };

    tokio::select! {
        _ = forward => {}
        _ = drain_incoming => {}
    }

    state.hub.unsubscribe(sub_id);
    debug!("subscriber {sub_id} disconnected");
    if let Err(e) = bridge.join() {
        warn!("websocket bridge thread for subscriber {sub_id} panicked: {e:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::manager::SessionManager;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(base: &std::path::Path) -> Arc<AppState> {
        Arc::new(AppState {
            manager: Arc::new(SessionManager::new(base.to_path_buf())),
            hub: Arc::new(BroadcastHub::new()),
            metrics: Metrics::new(|| 0),
            viewer_config_path: base.join("viewer_config.json"),
        })
    }

    #[tokio::test]
    async fn listing_sessions_on_empty_dir_is_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_session_returns_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_kind_filter_is_a_400() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (store, guard) = state
            .manager
            .create("s1", "jsonl", "pid:1".to_string(), 0)
            .await
            .unwrap();
        store.close().await.unwrap();
        drop(guard);

        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/s1/events?kind=99")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_snapshot_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
