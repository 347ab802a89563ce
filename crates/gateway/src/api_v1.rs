//! HTTP API v1: flow submission and inspection.
//!
//! Endpoints:
//!
//! - `GET  /v1/flows`                   - List flow definitions
//! - `GET  /v1/flows/{id}`              - Get one flow definition
//! - `POST /v1/flows/{id}/submit`       - Submit input, get an SSE stream
//! - `GET  /v1/instances`               - List instances (no Steps)
//! - `GET  /v1/instances/{id}`          - Get an instance with its redacted record
//! - `POST /v1/instances/{id}/cancel`   - Cancel a running instance
//! - `GET  /v1/ws`                      - WebSocket submit/cancel with streamed events
//! - `GET  /v1/logs`                    - SSE stream of domain events
//! - `GET  /v1/status`                  - Runtime status

use axum::{
    Router,
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, Sse},
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tracing::{info, warn};

use superego_config::AppConfig;
use superego_core::error::{Error, FlowError, StoreError};
use superego_core::flow::FlowDefinition;
use superego_core::instance::{FlowInstance, FlowStatus, InstanceView};
use superego_flow::{FlowEngine, FlowStreamEvent};

// ── State ─────────────────────────────────────────────────────────────────

/// Shared state for the v1 API.
pub struct ApiV1State {
    pub engine: FlowEngine,
    pub config: AppConfig,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

impl ApiV1State {
    pub fn new(engine: FlowEngine, config: AppConfig) -> Self {
        Self {
            engine,
            config,
            start_time: chrono::Utc::now(),
        }
    }
}

pub type SharedApiState = Arc<ApiV1State>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/flows", get(list_flows_handler))
        .route("/flows/{id}", get(get_flow_handler))
        .route("/flows/{id}/submit", post(submit_handler))
        .route("/instances", get(list_instances_handler))
        .route("/instances/{id}", get(get_instance_handler))
        .route("/instances/{id}/cancel", post(cancel_handler))
        .route("/ws", get(ws_handler))
        .route("/logs", get(log_stream_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map an engine error onto an HTTP status.
fn error_response(e: &Error) -> ApiError {
    let status = match e {
        Error::Store(StoreError::DefinitionNotFound(_) | StoreError::InstanceNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        Error::Flow(FlowError::InstanceBusy(_)) => StatusCode::CONFLICT,
        Error::Flow(FlowError::InvalidDefinition { .. } | FlowError::UnknownNode { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse { error: e.to_string() }))
}

fn store_error(e: StoreError) -> ApiError {
    error_response(&Error::Store(e))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlowSummary {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start: String,
    pub nodes: Vec<String>,
}

impl From<&FlowDefinition> for FlowSummary {
    fn from(def: &FlowDefinition) -> Self {
        Self {
            id: def.id.clone(),
            name: def.name.clone(),
            description: def.description.clone(),
            start: def.start.clone(),
            nodes: def.nodes.keys().cloned().collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlowListResponse {
    pub flows: Vec<FlowSummary>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub input: String,
    #[serde(default)]
    pub instance_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: String,
    pub definition_id: String,
    pub status: FlowStatus,
    pub current_node: Option<String>,
    pub steps: usize,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&FlowInstance> for InstanceSummary {
    fn from(instance: &FlowInstance) -> Self {
        Self {
            id: instance.id.clone(),
            definition_id: instance.definition_id.clone(),
            status: instance.status,
            current_node: instance.current_node.clone(),
            steps: instance.record.len(),
            updated_at: instance.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceListResponse {
    pub instances: Vec<InstanceSummary>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub instance_id: String,
    pub cancelled: bool,
}

// ── Flows ─────────────────────────────────────────────────────────────────

async fn list_flows_handler(
    State(state): State<SharedApiState>,
) -> Result<Json<FlowListResponse>, ApiError> {
    let definitions = state
        .engine
        .store()
        .list_flow_definitions()
        .await
        .map_err(store_error)?;
    let flows: Vec<FlowSummary> = definitions.iter().map(FlowSummary::from).collect();
    let count = flows.len();
    Ok(Json(FlowListResponse { flows, count }))
}

async fn get_flow_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<FlowDefinition>, ApiError> {
    state
        .engine
        .store()
        .load_flow_definition(&id)
        .await
        .map(Json)
        .map_err(store_error)
}

// ── SSE Submission ────────────────────────────────────────────────────────

/// `POST /v1/flows/{id}/submit`: Submit input and stream the run as SSE.
///
/// Events are `partial_output`, `complete_step`, and one terminal `error`
/// or `done` carrying the redacted record.
async fn submit_handler(
    State(state): State<SharedApiState>,
    Path(flow_id): Path<String>,
    Json(payload): Json<SubmitRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    info!(flow = %flow_id, continuing = payload.instance_id.is_some(), "v1 submit");

    let run = state
        .engine
        .submit(&flow_id, &payload.input, payload.instance_id.as_deref())
        .await
        .map_err(|e| error_response(&e))?;

    // The run outlives the HTTP stream; a closed connection does not cancel it.
    let (rx, _handle) = run.into_parts();

    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().event(event.event_type()).data(data))
    });

    Ok(Sse::new(stream))
}

// ── Instances ─────────────────────────────────────────────────────────────

async fn list_instances_handler(
    State(state): State<SharedApiState>,
) -> Result<Json<InstanceListResponse>, ApiError> {
    let mut instances = state
        .engine
        .store()
        .list_instances()
        .await
        .map_err(store_error)?;
    instances.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let instances: Vec<InstanceSummary> = instances.iter().map(InstanceSummary::from).collect();
    let count = instances.len();
    Ok(Json(InstanceListResponse { instances, count }))
}

async fn get_instance_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceView>, ApiError> {
    let instance = state
        .engine
        .store()
        .load_instance(&id)
        .await
        .map_err(store_error)?;
    Ok(Json(instance.public_view()))
}

/// `POST /v1/instances/{id}/cancel`: 202 when a running instance was
/// signalled, 409 when it exists but is idle, 404 otherwise.
async fn cancel_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    if state.engine.cancel(&id) {
        info!(instance_id = %id, "Cancellation requested");
        return Ok((
            StatusCode::ACCEPTED,
            Json(CancelResponse {
                instance_id: id,
                cancelled: true,
            }),
        ));
    }

    let instance = state
        .engine
        .store()
        .load_instance(&id)
        .await
        .map_err(store_error)?;
    Err((
        StatusCode::CONFLICT,
        Json(ErrorResponse {
            error: format!("Flow instance '{id}' is not running (status: {})", instance.status),
        }),
    ))
}

// ── WebSocket ─────────────────────────────────────────────────────────────

/// `GET /v1/ws`: Bidirectional WebSocket connection.
///
/// Protocol:
/// - Client → Server: `{ "type": "submit", "flow_id": "...", "input": "...", "instance_id": "..."? }`
///   or `{ "type": "cancel", "instance_id": "..." }`
/// - Server → Client: `FlowStreamEvent` JSON frames, plus `accepted`,
///   `cancelled` and `rejected` replies
///
/// One submission streams at a time per connection.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// WebSocket message from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsClientMessage {
    Submit {
        flow_id: String,
        input: String,
        #[serde(default)]
        instance_id: Option<String>,
    },
    Cancel {
        instance_id: String,
    },
}

/// Control replies that are not part of a run's event stream.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsReply {
    Accepted { instance_id: String },
    Cancelled { instance_id: String, accepted: bool },
    Rejected { message: String },
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> bool {
    let json = serde_json::to_string(value).unwrap_or_default();
    socket.send(WsMessage::Text(json.into())).await.is_ok()
}

/// Next event of the active run, or never when idle.
async fn next_event(
    active: &mut Option<mpsc::Receiver<FlowStreamEvent>>,
) -> Option<FlowStreamEvent> {
    match active {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_ws_connection(mut socket: WebSocket, state: SharedApiState) {
    info!("WebSocket connection established");
    let mut active: Option<mpsc::Receiver<FlowStreamEvent>> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let text = match msg {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue, // ignore binary, ping, pong
                };

                let reply = match serde_json::from_str::<WsClientMessage>(&text) {
                    Err(e) => WsReply::Rejected { message: format!("Invalid message: {e}") },
                    Ok(WsClientMessage::Cancel { instance_id }) => {
                        let accepted = state.engine.cancel(&instance_id);
                        WsReply::Cancelled { instance_id, accepted }
                    }
                    Ok(WsClientMessage::Submit { .. }) if active.is_some() => WsReply::Rejected {
                        message: "A submission is already streaming on this connection".into(),
                    },
                    Ok(WsClientMessage::Submit { flow_id, input, instance_id }) => {
                        match state.engine.submit(&flow_id, &input, instance_id.as_deref()).await {
                            Ok(run) => {
                                let instance_id = run.instance_id.clone();
                                let (rx, _handle) = run.into_parts();
                                active = Some(rx);
                                WsReply::Accepted { instance_id }
                            }
                            Err(e) => {
                                warn!(flow = %flow_id, error = %e, "WebSocket submission rejected");
                                WsReply::Rejected { message: e.to_string() }
                            }
                        }
                    }
                };

                if !send_json(&mut socket, &reply).await {
                    break;
                }
            }
            event = next_event(&mut active) => {
                let Some(event) = event else {
                    active = None;
                    continue;
                };
                if event.is_terminal() {
                    active = None;
                }
                if !send_json(&mut socket, &event).await {
                    break; // client disconnected
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

// ── SSE Log Stream ────────────────────────────────────────────────────────

/// `GET /v1/logs`: SSE stream of domain events.
async fn log_stream_handler(
    State(state): State<SharedApiState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.engine.events().subscribe();
    let stream = BroadcastStream::new(rx)
        .filter_map(|result| result.ok())
        .map(|event| {
            let data = serde_json::to_string(event.as_ref()).unwrap_or_default();
            Ok(SseEvent::default().event(event.event_type()).data(data))
        });

    Sse::new(stream)
}

// ── Status ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub provider: String,
    pub model: String,
    pub store: String,
    pub running_instances: usize,
}

async fn status_handler(State(state): State<SharedApiState>) -> Json<StatusResponse> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.start_time)
        .num_seconds()
        .max(0) as u64;

    Json(StatusResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_secs: uptime,
        provider: state.config.default_provider.clone(),
        model: state.config.effective_model().to_string(),
        store: state.engine.store().name().to_string(),
        running_instances: state.engine.running_instances().len(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────
