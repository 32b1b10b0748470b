use farmhand_channels::{CommandQueue, SessionRegistry, SocketConnection};
use farmhand_core::{
    AgentCommand, BroadcastSink, Config, Error, FarmSettings, Paths, Priority, Reporter, Telemetry,
    TelemetryFrame,
};
use farmhand_scheduler::{BulkOptions, BulkOrchestrator, FarmScheduler, StallWatchdog, TelemetryRouter};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path as AxumPath, Query, State,
    },
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// ---------------------------------------------------------------------------
// Shared state passed to HTTP/WS handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct GatewayState {
    registry: Arc<SessionRegistry>,
    queue: Arc<CommandQueue>,
    farm: Arc<FarmScheduler>,
    bulk: Arc<BulkOrchestrator>,
    events: Arc<BroadcastSink>,
    telemetry_tx: mpsc::Sender<Telemetry>,
    api_token: Option<String>,
}

/// Constant-time comparison for auth tokens.
fn secure_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (&x, &y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn token_matches(expected: &Option<String>, bearer: Option<&str>, query: Option<&str>) -> bool {
    let Some(expected) = expected.as_deref() else {
        return true;
    };
    let from_header = bearer
        .and_then(|h| h.strip_prefix("Bearer "))
        .map_or(false, |t| secure_eq(t, expected));
    let from_query = query.map(|q| secure_eq(q, expected)).unwrap_or(false);
    from_header || from_query
}

// ---------------------------------------------------------------------------
// Bearer token authentication middleware
// ---------------------------------------------------------------------------

async fn auth_middleware(
    State(state): State<GatewayState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if req.uri().path() == "/v1/health" {
        return next.run(req).await;
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if token_matches(&state.api_token, auth_header, None) {
        next.run(req).await
    } else {
        (StatusCode::UNAUTHORIZED, "Unauthorized: invalid or missing Bearer token").into_response()
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotConnected(_) | Error::AlreadyRunning(_) | Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::SessionNotFound { .. } | Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = std::result::Result<Json<serde_json::Value>, ApiError>;

// ---------------------------------------------------------------------------
// HTTP request types
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FarmStartRequest {
    interval_minutes: Option<u32>,
    jitter_minutes: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkStartRequest {
    agent_ids: Vec<String>,
    #[serde(default)]
    settings: Option<FarmSettings>,
    #[serde(default)]
    options: BulkOptions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueRequest {
    agent_id: String,
    action: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    priority: Priority,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromoteRequest {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentSocketQuery {
    agent_id: String,
    #[serde(default)]
    was_master: bool,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Deserialize)]
struct EventSocketQuery {
    #[serde(default)]
    token: Option<String>,
}

// ---------------------------------------------------------------------------
// Admin handlers
// ---------------------------------------------------------------------------

async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn handle_agents_list(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({ "agents": state.registry.list_agents().await }))
}

async fn handle_agent_promote(
    State(state): State<GatewayState>,
    AxumPath(agent_id): AxumPath<String>,
    Json(req): Json<PromoteRequest>,
) -> ApiResult {
    state.registry.promote(&agent_id, &req.session_id).await?;
    Ok(Json(json!({ "status": "ok", "masterSessionId": req.session_id })))
}

async fn handle_farm_list(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({ "sessions": state.farm.list().await }))
}

async fn handle_farm_get(State(state): State<GatewayState>, AxumPath(agent_id): AxumPath<String>) -> ApiResult {
    let session = state
        .farm
        .get(&agent_id)
        .await
        .ok_or_else(|| Error::NotFound(format!("farm session for {}", agent_id)))?;
    Ok(Json(json!(session)))
}

async fn handle_farm_start(
    State(state): State<GatewayState>,
    AxumPath(agent_id): AxumPath<String>,
    body: Option<Json<FarmStartRequest>>,
) -> ApiResult {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let defaults = state.farm.default_settings();
    let settings = FarmSettings::new(
        req.interval_minutes.unwrap_or(defaults.interval_minutes),
        req.jitter_minutes.unwrap_or(defaults.jitter_minutes),
    );
    let outcome = state.farm.start(&agent_id, Some(settings)).await?;
    Ok(Json(json!({ "status": outcome })))
}

async fn handle_farm_stop(State(state): State<GatewayState>, AxumPath(agent_id): AxumPath<String>) -> ApiResult {
    state.farm.stop(&agent_id).await?;
    Ok(Json(json!({ "status": "stopped" })))
}

async fn handle_farm_pause(State(state): State<GatewayState>, AxumPath(agent_id): AxumPath<String>) -> ApiResult {
    state.farm.pause(&agent_id).await?;
    Ok(Json(json!({ "status": "paused" })))
}

async fn handle_farm_resume(State(state): State<GatewayState>, AxumPath(agent_id): AxumPath<String>) -> ApiResult {
    state.farm.resume(&agent_id).await?;
    Ok(Json(json!({ "status": "resumed" })))
}

async fn handle_bulk_status(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({ "operation": state.bulk.status().await }))
}

async fn handle_bulk_start(State(state): State<GatewayState>, Json(req): Json<BulkStartRequest>) -> ApiResult {
    let id = state.bulk.start(&req.agent_ids, req.settings, req.options).await?;
    Ok(Json(json!({ "operationId": id })))
}

async fn handle_bulk_stop(State(state): State<GatewayState>) -> ApiResult {
    let op = state.bulk.stop().await?;
    Ok(Json(json!({ "operation": op })))
}

async fn handle_bulk_stop_all(State(state): State<GatewayState>) -> ApiResult {
    let op = state.bulk.stop_all_farms().await?;
    Ok(Json(json!({ "operation": op })))
}

async fn handle_queue_status(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!(state.queue.status().await))
}

async fn handle_queue_enqueue(State(state): State<GatewayState>, Json(req): Json<EnqueueRequest>) -> ApiResult {
    if req.action.trim().is_empty() {
        return Err(Error::Validation("action is required".to_string()).into());
    }
    let command = AgentCommand::new(&req.action, req.payload);
    let id = state.queue.enqueue(&req.agent_id, command, req.priority).await;
    Ok(Json(json!({ "queueId": id })))
}

async fn handle_queue_clear(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({ "removed": state.queue.clear_all().await }))
}

async fn handle_queue_cancel(
    State(state): State<GatewayState>,
    AxumPath(agent_id): AxumPath<String>,
) -> impl IntoResponse {
    Json(json!({ "removed": state.queue.cancel_for_agent(&agent_id).await }))
}

// ---------------------------------------------------------------------------
// Agent socket: one browser tab per connection
// ---------------------------------------------------------------------------

async fn handle_agent_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Query(query): Query<AgentSocketQuery>,
) -> impl IntoResponse {
    // Close with 4401 rather than failing the upgrade, so the client sees why.
    let token_valid = token_matches(&state.api_token, None, query.token.as_deref());

    ws.on_upgrade(move |socket| async move {
        if !token_valid {
            close_unauthorized(socket).await;
            return;
        }
        handle_agent_connection(socket, state, query.agent_id, query.was_master).await;
    })
}

async fn close_unauthorized(mut socket: WebSocket) {
    let _ = socket
        .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
            code: 4401,
            reason: std::borrow::Cow::Borrowed("Unauthorized"),
        })))
        .await;
}

async fn handle_agent_connection(socket: WebSocket, state: GatewayState, agent_id: String, was_master: bool) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(64);

    // Task: write queued frames to this socket
    let send_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if ws_sender.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let registration = state
        .registry
        .register(&agent_id, SocketConnection::handle(frame_tx), was_master)
        .await;
    let session_id = registration.session_id;

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Agent socket receive error");
                break;
            }
        };

        match msg {
            WsMessage::Text(text) => {
                handle_agent_frame(&state, &agent_id, &session_id, &text).await;
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    state.registry.disconnect(&agent_id, &session_id).await;
    send_task.abort();
}

async fn handle_agent_frame(state: &GatewayState, agent_id: &str, session_id: &str, text: &str) {
    let parsed: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(agent_id = %agent_id, error = %e, "Ignoring malformed agent frame");
            return;
        }
    };

    match parsed.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "telemetry" => match serde_json::from_value::<TelemetryFrame>(parsed) {
            Ok(frame) => {
                if state.telemetry_tx.send(frame.into_telemetry(agent_id)).await.is_err() {
                    warn!(agent_id = %agent_id, "Telemetry router is gone");
                }
            }
            Err(e) => debug!(agent_id = %agent_id, error = %e, "Ignoring malformed telemetry"),
        },
        "promote" => {
            if let Err(e) = state.registry.promote(agent_id, session_id).await {
                warn!(agent_id = %agent_id, session_id = %session_id, error = %e, "Takeover request rejected");
            }
        }
        "ping" => state.registry.touch(agent_id).await,
        other => debug!(agent_id = %agent_id, frame_type = %other, "Ignoring unknown agent frame"),
    }
}

// ---------------------------------------------------------------------------
// Event socket: read-only stream of report events
// ---------------------------------------------------------------------------

async fn handle_events_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Query(query): Query<EventSocketQuery>,
) -> impl IntoResponse {
    let token_valid = token_matches(&state.api_token, None, query.token.as_deref());

    ws.on_upgrade(move |socket| async move {
        if !token_valid {
            close_unauthorized(socket).await;
            return;
        }
        handle_events_connection(socket, state).await;
    })
}

async fn handle_events_connection(socket: WebSocket, state: GatewayState) {
    debug!("Event stream client connected");
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if ws_sender.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event stream client lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Consumers only observe; drain until the client goes away.
    while let Some(Ok(msg)) = ws_receiver.next().await {
        if matches!(msg, WsMessage::Close(_)) {
            break;
        }
    }
    send_task.abort();
    debug!("Event stream client disconnected");
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run(cli_host: Option<String>, cli_port: Option<u16>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;

    let host = cli_host.unwrap_or_else(|| config.gateway.host.clone());
    let port = cli_port.unwrap_or(config.gateway.port);
    let api_token = config.api_token();
    if api_token.is_none() {
        warn!("No API token configured, admin endpoints are open");
    }

    let events = Arc::new(BroadcastSink::new(1024));
    let reporter = Reporter::new(events.clone());

    let registry = Arc::new(SessionRegistry::new(reporter.clone()));
    let queue = Arc::new(CommandQueue::new(&config.queue, registry.clone(), reporter.clone()));
    let farm = Arc::new(FarmScheduler::new(&config.farm, registry.clone(), reporter.clone()));
    let bulk = Arc::new(BulkOrchestrator::new(
        &config.bulk,
        farm.clone(),
        registry.clone(),
        reporter.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (telemetry_tx, telemetry_rx) = mpsc::channel::<Telemetry>(1024);
    let router = Arc::new(TelemetryRouter::new(
        registry.clone(),
        farm.clone(),
        bulk.clone(),
        reporter.clone(),
    ));
    let router_handle = tokio::spawn(router.run_loop(telemetry_rx, shutdown_tx.subscribe()));

    let watchdog = Arc::new(StallWatchdog::new(farm.clone(), config.farm.watchdog_interval()));
    let watchdog_handle = tokio::spawn(watchdog.run_loop(shutdown_tx.subscribe()));

    let gateway_state = GatewayState {
        registry,
        queue,
        farm,
        bulk,
        events,
        telemetry_tx,
        api_token,
    };

    let app = Router::new()
        .route("/v1/health", get(handle_health))
        .route("/v1/agents", get(handle_agents_list))
        .route("/v1/agents/:id/promote", post(handle_agent_promote))
        .route("/v1/farm", get(handle_farm_list))
        .route("/v1/farm/:id", get(handle_farm_get))
        .route("/v1/farm/:id/start", post(handle_farm_start))
        .route("/v1/farm/:id/stop", post(handle_farm_stop))
        .route("/v1/farm/:id/pause", post(handle_farm_pause))
        .route("/v1/farm/:id/resume", post(handle_farm_resume))
        .route("/v1/bulk", get(handle_bulk_status))
        .route("/v1/bulk/start", post(handle_bulk_start))
        .route("/v1/bulk/stop", post(handle_bulk_stop))
        .route("/v1/bulk/stop-all", post(handle_bulk_stop_all))
        .route(
            "/v1/queue",
            get(handle_queue_status).post(handle_queue_enqueue).delete(handle_queue_clear),
        )
        .route("/v1/queue/:agent_id", delete(handle_queue_cancel))
        .layer(middleware::from_fn_with_state(gateway_state.clone(), auth_middleware))
        // Sockets check `?token=` themselves; browsers cannot set headers on them.
        .route("/v1/agents/ws", get(handle_agent_ws_upgrade))
        .route("/v1/events", get(handle_events_ws_upgrade))
        .layer(CorsLayer::permissive().allow_credentials(false))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway_state);

    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "Gateway listening");

    let http_shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = http_shutdown_rx;
                let _ = rx.recv().await;
            })
            .await
            .ok();
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining tasks...");
    let _ = shutdown_tx.send(());

    let _ = http_handle.await;
    let _ = router_handle.await;
    let _ = watchdog_handle.await;
    info!("Gateway stopped");
    Ok(())
}
