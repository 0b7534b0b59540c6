use acp_core::watch::{LogFollower, MetadataWatch, WorkspaceWatch};
use acp_core::{
    AgentApiError, AgentManifest, AgentStats, AgentView, BuildSpec, EndPayload,
    ListeningPortsResponse, MetadataResult, PatchLogsRequest, PostAppHealthRequest,
    PostLifecycleRequest, PostStartupRequest, Registry, StartupLogEntry, StatsResponse,
    WatchFrame, WorkspaceSnapshot,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct HubState {
    pub registry: Arc<Registry>,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
}

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/agent/manifest", get(agent_manifest))
        .route("/api/agent/logs", patch(agent_logs))
        .route("/api/agent/lifecycle", post(agent_lifecycle))
        .route("/api/agent/metadata/:key", post(agent_metadata))
        .route("/api/agent/app-health", post(agent_app_health))
        .route("/api/agent/startup", post(agent_startup))
        .route("/api/agent/stats", post(agent_stats))
        .route("/api/agent/listen", get(agent_listen))
        .route("/api/agents/:id", get(get_agent))
        .route("/api/agents/:id/logs", get(agent_logs_after))
        .route("/api/agents/:id/metadata/watch", get(watch_metadata))
        .route("/api/agents/:id/listening-ports", get(listening_ports))
        .route("/api/workspaces/:id", get(get_workspace))
        .route("/api/workspaces/:id/watch", get(watch_workspace))
        .route("/api/builds", post(register_build))
        .route("/api/builds/:id", delete(destroy_build))
        .with_state(state)
}

/// Maps registry errors onto `{code, message}` bodies.
pub struct ApiError(AgentApiError);

impl From<AgentApiError> for ApiError {
    fn from(err: AgentApiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn bearer_token(headers: &HeaderMap) -> &str {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default()
}

async fn authenticated(hub: &HubState, headers: &HeaderMap) -> ApiResult<Uuid> {
    Ok(hub.registry.authenticate(bearer_token(headers)).await?)
}

async fn agent_manifest(
    State(hub): State<HubState>,
    headers: HeaderMap,
) -> ApiResult<Json<AgentManifest>> {
    let agent_id = authenticated(&hub, &headers).await?;
    Ok(Json(hub.registry.manifest(agent_id).await?))
}

async fn agent_logs(
    State(hub): State<HubState>,
    headers: HeaderMap,
    Json(request): Json<PatchLogsRequest>,
) -> ApiResult<Json<Vec<StartupLogEntry>>> {
    let agent_id = authenticated(&hub, &headers).await?;
    Ok(Json(hub.registry.append_logs(agent_id, request.logs).await?))
}

async fn agent_lifecycle(
    State(hub): State<HubState>,
    headers: HeaderMap,
    Json(request): Json<PostLifecycleRequest>,
) -> ApiResult<StatusCode> {
    let agent_id = authenticated(&hub, &headers).await?;
    hub.registry.set_lifecycle(agent_id, &request.state).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn agent_metadata(
    State(hub): State<HubState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(result): Json<MetadataResult>,
) -> ApiResult<StatusCode> {
    let agent_id = authenticated(&hub, &headers).await?;
    hub.registry.post_metadata(agent_id, &key, result).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn agent_app_health(
    State(hub): State<HubState>,
    headers: HeaderMap,
    Json(request): Json<PostAppHealthRequest>,
) -> ApiResult<StatusCode> {
    let agent_id = authenticated(&hub, &headers).await?;
    hub.registry
        .post_app_health(agent_id, &request.healths)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn agent_startup(
    State(hub): State<HubState>,
    headers: HeaderMap,
    Json(request): Json<PostStartupRequest>,
) -> ApiResult<StatusCode> {
    let agent_id = authenticated(&hub, &headers).await?;
    hub.registry.post_startup(agent_id, request).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn agent_stats(
    State(hub): State<HubState>,
    headers: HeaderMap,
    Json(stats): Json<AgentStats>,
) -> ApiResult<Json<StatsResponse>> {
    let agent_id = authenticated(&hub, &headers).await?;
    Ok(Json(hub.registry.report_stats(agent_id, &stats).await?))
}

async fn agent_listen(
    State(hub): State<HubState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let agent_id = authenticated(&hub, &headers).await?;
    Ok(ws.on_upgrade(move |socket| async move {
        serve_agent_channel(hub, agent_id, socket).await;
    }))
}

async fn get_agent(
    State(hub): State<HubState>,
    Path(agent_id): Path<Uuid>,
) -> ApiResult<Json<AgentView>> {
    Ok(Json(hub.registry.agent(agent_id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    after: u64,
    #[serde(default)]
    follow: bool,
}

async fn agent_logs_after(
    State(hub): State<HubState>,
    Path(agent_id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
    ws: Option<WebSocketUpgrade>,
) -> ApiResult<Response> {
    match (query.follow, ws) {
        (true, Some(ws)) => {
            let follower = hub.registry.follow_logs(agent_id, query.after).await?;
            let write_timeout = hub.write_timeout;
            Ok(ws.on_upgrade(move |socket| async move {
                stream_feed(socket, Feed::Logs(follower), write_timeout).await;
            }))
        }
        _ => {
            let entries = hub.registry.logs_after(agent_id, query.after).await?;
            Ok(Json(entries).into_response())
        }
    }
}

async fn watch_metadata(
    State(hub): State<HubState>,
    Path(agent_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let watch = hub.registry.watch_metadata(agent_id).await?;
    let write_timeout = hub.write_timeout;
    Ok(ws.on_upgrade(move |socket| async move {
        stream_feed(socket, Feed::Metadata(watch), write_timeout).await;
    }))
}

async fn listening_ports(
    State(hub): State<HubState>,
    Path(agent_id): Path<Uuid>,
) -> ApiResult<Json<ListeningPortsResponse>> {
    let ports = hub.registry.list_ports(agent_id).await?;
    Ok(Json(ListeningPortsResponse { ports }))
}

async fn get_workspace(
    State(hub): State<HubState>,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<Json<WorkspaceSnapshot>> {
    Ok(Json(hub.registry.workspace(workspace_id).await?))
}

async fn watch_workspace(
    State(hub): State<HubState>,
    Path(workspace_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let watch = hub.registry.watch_workspace(workspace_id).await?;
    let write_timeout = hub.write_timeout;
    Ok(ws.on_upgrade(move |socket| async move {
        stream_feed(socket, Feed::Workspace(watch), write_timeout).await;
    }))
}

async fn register_build(
    State(hub): State<HubState>,
    Json(build): Json<BuildSpec>,
) -> ApiResult<StatusCode> {
    hub.registry.register_build(build).await?;
    Ok(StatusCode::CREATED)
}

async fn destroy_build(
    State(hub): State<HubState>,
    Path(build_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    hub.registry.destroy_build(build_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Keeps the agent marked connected while its coordination socket is open.
async fn serve_agent_channel(hub: HubState, agent_id: Uuid, socket: WebSocket) {
    if let Err(err) = hub.registry.agent_connected(agent_id).await {
        warn!(event = "listen_rejected", agent_id = %agent_id, error = %err);
        return;
    }
    let (mut sender, mut receiver) = socket.split();
    let ping_every = if hub.ping_interval.is_zero() {
        Duration::from_secs(10)
    } else {
        hub.ping_interval
    };
    let mut ticker = tokio::time::interval(ping_every);
    ticker.tick().await;

    let reason = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ping = sender.send(Message::Ping(Vec::new()));
                if !matches!(tokio::time::timeout(hub.write_timeout, ping).await, Ok(Ok(()))) {
                    break "ping_failed";
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break "agent_close",
                    Some(Err(err)) => {
                        warn!(event = "listen_read_error", agent_id = %agent_id, error = %err);
                        break "read_error";
                    }
                    Some(Ok(_)) => {
                        let _ = hub.registry.touch_agent(agent_id).await;
                    }
                }
            }
        }
    };

    info!(event = "listen_closed", agent_id = %agent_id, reason = reason);
    let _ = hub.registry.agent_disconnected(agent_id).await;
}

enum Feed {
    Logs(LogFollower),
    Metadata(MetadataWatch),
    Workspace(WorkspaceWatch),
}

impl Feed {
    fn label(&self) -> &'static str {
        match self {
            Feed::Logs(_) => "logs",
            Feed::Metadata(_) => "metadata",
            Feed::Workspace(_) => "workspace",
        }
    }

    async fn next_frame(&mut self) -> Option<WatchFrame> {
        match self {
            Feed::Logs(follower) => follower.next_batch().await.map(WatchFrame::Logs),
            Feed::Metadata(watch) => watch.next_snapshot().await.map(WatchFrame::Metadata),
            Feed::Workspace(watch) => watch.next_snapshot().await.map(WatchFrame::Workspace),
        }
    }

    fn end_reason(&self) -> &'static str {
        match self {
            Feed::Logs(follower) => follower.end_reason(),
            Feed::Metadata(watch) => watch.end_reason(),
            Feed::Workspace(watch) => watch.end_reason(),
        }
    }
}

/// Pushes frames until the feed ends, then sends an explicit `end` frame
/// before closing. A client that goes away just drops its registration.
async fn stream_feed(socket: WebSocket, mut feed: Feed, write_timeout: Duration) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            frame = feed.next_frame() => {
                let Some(frame) = frame else { break };
                if !send_frame(&mut sender, &frame, write_timeout).await {
                    warn!(event = "watch_write_failed", feed = feed.label());
                    return;
                }
            }
            incoming = receiver.next() => {
                if matches!(incoming, None | Some(Err(_)) | Some(Ok(Message::Close(_)))) {
                    debug!(event = "watch_client_gone", feed = feed.label());
                    return;
                }
            }
        }
    }

    let reason = feed.end_reason();
    debug!(event = "watch_end", feed = feed.label(), reason = reason);
    let end = WatchFrame::End(EndPayload {
        reason: reason.to_string(),
    });
    if send_frame(&mut sender, &end, write_timeout).await {
        let _ = sender.send(Message::Close(None)).await;
    }
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &WatchFrame,
    write_timeout: Duration,
) -> bool {
    let text = match serde_json::to_string(frame) {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "frame_encode_failed", error = %err);
            return false;
        }
    };
    matches!(
        tokio::time::timeout(write_timeout, sender.send(Message::Text(text))).await,
        Ok(Ok(()))
    )
}
