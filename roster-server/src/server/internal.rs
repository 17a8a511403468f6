use super::{
    BridgeQuery, CommandsResponse, ConnectedRequest, DisconnectResponse, HealthResponse,
    LoginRequest, LoginResponse, NodeItem, NodesResponse, OrphanedItem, PingRequest, PingResponse,
    ServerState, ServerSwitchRequest, SessionResponse, error_response, settle,
};
use async_trait::async_trait;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use roster_core::{
    DisconnectEvent, LoginEvent, LoginOutcome, PingEvent, PostLoginEvent, ProxyHost,
    QueryMessage, ReplySink, Result, RosterError, ServerSwitchEvent, online_set_key,
};
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use uuid::Uuid;

pub(crate) async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        node_id: state.presence.node_id().to_string(),
        online: state.presence.cluster().cached_count(),
    })
}

pub(crate) async fn v1_nodes(State(state): State<Arc<ServerState>>) -> Response {
    let cluster = state.presence.cluster();
    let nodes = match cluster.nodes().live_nodes().await {
        Ok(nodes) => nodes,
        Err(error) => return error_response(error),
    };

    let mut items = Vec::with_capacity(nodes.len());
    for node in nodes {
        let online = match state
            .backend
            .store
            .set_len(&online_set_key(&node.node_id))
            .await
        {
            Ok(online) => online,
            Err(error) => return error_response(error),
        };
        items.push(NodeItem {
            local: node.node_id == state.presence.node_id(),
            node_id: node.node_id,
            last_heartbeat: node.last_heartbeat,
            online,
        });
    }

    let orphaned = match cluster.orphaned_online_sets().await {
        Ok(orphaned) => orphaned
            .into_iter()
            .map(|(node_id, online)| OrphanedItem { node_id, online })
            .collect(),
        Err(error) => return error_response(error),
    };

    Json(NodesResponse {
        nodes: items,
        orphaned,
    })
    .into_response()
}

/// Blocks until the conflict check is done and returns the verdict.
pub(crate) async fn v1_login(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<LoginRequest>,
) -> Response {
    let event = LoginEvent::new(request.id, request.name, request.address);
    let check = state.presence.on_login(&event);

    let response = match event.completed().await {
        LoginOutcome::Allowed => LoginResponse {
            allowed: true,
            reason: None,
        },
        LoginOutcome::Denied { reason } => LoginResponse {
            allowed: false,
            reason,
        },
    };

    // A failed check still lets the login through, but the proxy should know.
    if let Err(error) = settle(check).await {
        tracing::warn!("Conflict check for {} did not finish: {}", request.id, error);
    }

    Json(response).into_response()
}

pub(crate) async fn v1_session_connected(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ConnectedRequest>,
) -> Response {
    state
        .host
        .open_session(id, request.name.clone(), request.address)
        .await;

    let task = state.presence.on_post_login(PostLoginEvent {
        id,
        name: request.name,
        address: request.address,
    });

    match settle(task).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn v1_session_server(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ServerSwitchRequest>,
) -> Response {
    if !state.host.has_server(&request.server) {
        return error_response(RosterError::UnknownServer(request.server));
    }

    state.host.move_session(&id, &request.server).await;
    let task = state.presence.on_server_change(ServerSwitchEvent {
        id,
        previous: request.previous,
        server: request.server,
    });

    match settle(task).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn v1_session_disconnect(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Response {
    state.host.close_session(&id).await;

    let kicked_elsewhere = match state.presence.was_kicked_elsewhere(&id).await {
        Ok(kicked) => kicked,
        Err(error) => return error_response(error),
    };

    match settle(state.presence.on_disconnect(DisconnectEvent { id })).await {
        Ok(()) => Json(DisconnectResponse { kicked_elsewhere }).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn v1_session_get(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match session_view(&state, id).await {
        Ok(view) => Json(view).into_response(),
        Err(error) => error_response(error),
    }
}

async fn session_view(state: &ServerState, id: Uuid) -> Result<SessionResponse> {
    let cluster = state.presence.cluster();
    let local = state.host.session(&id).await;

    let name = match &local {
        Some(session) => Some(session.name.clone()),
        None => state.presence.directory().id_to_name(&id, false).await?,
    };

    Ok(SessionResponse {
        id,
        name,
        address: local.as_ref().map(|session| session.address),
        node: cluster.node_of(&id).await?,
        server: match cluster.server_of(&id).await? {
            Some(server) => Some(server),
            None => local.as_ref().and_then(|session| session.server.clone()),
        },
        last_online: cluster.last_online(&id).await?,
        kicked_elsewhere: state.presence.was_kicked_elsewhere(&id).await?,
        kick_reason: local.and_then(|session| session.kick_reason),
    })
}

pub(crate) async fn v1_ping(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<PingRequest>,
) -> impl IntoResponse {
    let mut ping = PingEvent {
        address: request.address,
        forced_host: request.forced_host,
        ping_passthrough: request.ping_passthrough,
        online: request.online,
    };
    state.presence.on_ping(&mut ping);

    Json(PingResponse {
        online: ping.online,
    })
}

/// Collects the single reply a bridge request may produce.
struct OneshotReply {
    sender: Mutex<Option<oneshot::Sender<Bytes>>>,
}

#[async_trait]
impl ReplySink for OneshotReply {
    async fn send(&self, _channel: &str, data: Bytes) -> Result<()> {
        let Some(sender) = self.sender.lock().await.take() else {
            return Err(RosterError::Internal("bridge reply already sent".to_string()));
        };
        sender
            .send(data)
            .map_err(|_| RosterError::Internal("bridge caller went away".to_string()))
    }
}

pub(crate) async fn v1_bridge(
    State(state): State<Arc<ServerState>>,
    Path(channel): Path<String>,
    Query(query): Query<BridgeQuery>,
    body: Bytes,
) -> Response {
    let (sender, mut receiver) = oneshot::channel();
    let reply = Arc::new(OneshotReply {
        sender: Mutex::new(Some(sender)),
    });

    let message = QueryMessage {
        channel,
        from_backend: query.from_backend,
        data: body,
    };
    let Some(task) = state.bridge.dispatch(message, reply) else {
        return StatusCode::NO_CONTENT.into_response();
    };

    if let Err(error) = task.await {
        return error_response(RosterError::Internal(error.to_string()));
    }

    match receiver.try_recv() {
        Ok(data) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response(),
        Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

pub(crate) async fn v1_commands(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(CommandsResponse {
        commands: state.host.drain_commands().await,
    })
}
