//! HTTP surface: status, version, JSON-RPC submissions, and the two
//! websocket upgrade endpoints (`/w` for workers, `/d` for peers).

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::node::Dispatcher;
use crate::scheduler::job::JobPriority;
use crate::session::{SessionHandle, SessionId};

/// Payload of `GET /version`, also consumed during peer bootstrap to pick
/// the sync peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub version: String,
    pub height: u64,
    pub block_hashes: Vec<String>,
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(status_handler))
        .route("/version", get(version_handler))
        .route("/rpc", post(rpc_handler))
        .route("/w", get(worker_upgrade))
        .route("/d", get(peer_upgrade))
        .layer(cors)
        .with_state(dispatcher)
}

async fn status_handler(State(dispatcher): State<Arc<Dispatcher>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "running",
        "pub": dispatcher.public_hex(),
    }))
}

async fn version_handler(State(dispatcher): State<Arc<Dispatcher>>) -> impl IntoResponse {
    Json(dispatcher.version())
}

// ── JSON-RPC ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    id: serde_json::Value,
}

#[derive(Deserialize)]
struct SubmitParams {
    /// Opaque task payload, hex-encoded.
    task: String,
    #[serde(default = "default_priority")]
    priority: JobPriority,
}

fn default_priority() -> JobPriority {
    JobPriority::Medium
}

#[derive(Deserialize)]
struct CancelParams {
    id: Uuid,
}

fn rpc_ok(id: serde_json::Value, result: serde_json::Value) -> Json<serde_json::Value> {
    Json(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn rpc_err(id: serde_json::Value, code: i64, message: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    }))
}

/// Minimal client surface: `job.submit` blocks until the terminal job value
/// arrives on the result channel; `job.cancel` flags a queued job.
async fn rpc_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<RpcRequest>,
) -> impl IntoResponse {
    match req.method.as_str() {
        "job.submit" => {
            let params: SubmitParams = match serde_json::from_value(req.params) {
                Ok(p) => p,
                Err(e) => return rpc_err(req.id, -32602, &e.to_string()),
            };
            let task = match hex::decode(&params.task) {
                Ok(t) => t,
                Err(_) => return rpc_err(req.id, -32602, "task must be hex encoded"),
            };
            let (job_id, result_rx) = dispatcher.submit_job(task, params.priority).await;
            match result_rx.await {
                Ok(job) => rpc_ok(
                    req.id,
                    serde_json::json!({"id": job_id, "job": job}),
                ),
                Err(_) => rpc_err(req.id, -32000, "dispatcher dropped the job"),
            }
        }
        "job.cancel" => {
            let params: CancelParams = match serde_json::from_value(req.params) {
                Ok(p) => p,
                Err(e) => return rpc_err(req.id, -32602, &e.to_string()),
            };
            dispatcher.cancel_job(params.id).await;
            rpc_ok(req.id, serde_json::json!({"cancelled": params.id}))
        }
        _ => rpc_err(req.id, -32601, "method not found"),
    }
}

// ── Websocket sessions ──────────────────────────────────────────

async fn worker_upgrade(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Arc<Dispatcher>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| worker_socket(socket, dispatcher))
}

async fn peer_upgrade(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Arc<Dispatcher>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| peer_socket(socket, dispatcher))
}

async fn worker_socket(socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    let session = SessionId::next();
    let (handle, mut receiver) = spawn_writer(socket);

    while let Some(Ok(msg)) = receiver.next().await {
        if let WsMessage::Binary(frame) = msg {
            if dispatcher
                .handle_worker_frame(session, &handle, &frame)
                .await
                .is_err()
            {
                break;
            }
        }
    }
    dispatcher.handle_worker_disconnect(session).await;
}

async fn peer_socket(socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    let session = SessionId::next();
    let (handle, mut receiver) = spawn_writer(socket);

    while let Some(Ok(msg)) = receiver.next().await {
        if let WsMessage::Binary(frame) = msg {
            if dispatcher
                .handle_peer_frame(session, &handle, &frame)
                .await
                .is_err()
            {
                break;
            }
        }
    }
    dispatcher.handle_peer_disconnect(session).await;
}

/// Start the writer task draining the session's outbound channel into the
/// socket, and hand back the session handle plus the read half.
fn spawn_writer(socket: WebSocket) -> (SessionHandle, futures::stream::SplitStream<WebSocket>) {
    let (mut sink, stream) = socket.split();
    let (handle, mut outbound_rx) = SessionHandle::new();
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(WsMessage::Binary(frame)).await.is_err() {
                break;
            }
        }
    });
    (handle, stream)
}
