use crate::config::Config;
use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use roster_core::{
    Backend, CommandRelay, DataRelay, PresenceSync, QueryBridge, Result, RosterError,
    StoreIdentityDirectory, supervise,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::interval;

mod host;
mod internal;
mod types;

pub(crate) use host::SidecarHost;
use internal::{
    health, v1_bridge, v1_commands, v1_login, v1_nodes, v1_ping, v1_session_connected,
    v1_session_disconnect, v1_session_get, v1_session_server,
};
pub(crate) use types::*;

pub struct ServerState {
    pub(crate) backend: Backend,
    pub(crate) presence: PresenceSync,
    pub(crate) bridge: QueryBridge,
    pub(crate) host: Arc<SidecarHost>,
}

pub async fn run_server(config: Config, backend: Backend) -> Result<()> {
    let directory = Arc::new(StoreIdentityDirectory::new(backend.store.clone()));
    let presence = PresenceSync::new(
        config.presence_config(),
        backend.store.clone(),
        backend.bus.clone(),
        directory,
        Handle::current(),
    );

    if presence.cluster().nodes().is_id_in_use().await? {
        return Err(RosterError::Config(format!(
            "node id '{}' already has a live heartbeat; is another node running with it?",
            presence.node_id()
        )));
    }

    // Sessions left behind by a previous run of this node.
    presence.reset_node().await?;
    let online = presence.tick().await?;
    tracing::info!("Node {} registered, {} players online", presence.node_id(), online);

    let host = Arc::new(SidecarHost::new(config.servers.clone()));
    let bridge = QueryBridge::new(&presence, host.clone(), config.bridge.channels.clone());

    let policy = config.command_policy();
    if !policy.is_restricted() {
        tracing::warn!(
            "Command relay is unauthenticated: anything published to {} runs on this node",
            presence.channels().command_channels().join(", ")
        );
    }

    let mut background = vec![
        {
            let relay = CommandRelay::new(&presence, host.clone(), policy);
            spawn_relay("command relay", move || relay.clone().run())
        },
        {
            let relay = DataRelay::new(&presence, host.clone());
            spawn_relay("data relay", move || relay.clone().run())
        },
    ];

    {
        let heartbeat = presence.clone();
        let period = config.heartbeat_interval();
        background.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if let Err(error) = heartbeat.tick().await {
                    tracing::warn!("Failed to refresh node heartbeat: {}", error);
                }
            }
        }));
    }

    let state = Arc::new(ServerState {
        backend,
        presence: presence.clone(),
        bridge,
        host,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/internal/v1/nodes", get(v1_nodes))
        .route("/internal/v1/sessions/login", post(v1_login))
        .route(
            "/internal/v1/sessions/:id",
            get(v1_session_get).delete(v1_session_disconnect),
        )
        .route(
            "/internal/v1/sessions/:id/connected",
            post(v1_session_connected),
        )
        .route("/internal/v1/sessions/:id/server", post(v1_session_server))
        .route("/internal/v1/ping", post(v1_ping))
        .route("/internal/v1/bridge/:channel", post(v1_bridge))
        .route("/internal/v1/commands", get(v1_commands))
        .with_state(state);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Roster listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in background {
        task.abort();
    }

    let cleaned = presence.reset_node().await?;
    presence.cluster().nodes().deregister().await?;
    tracing::info!(
        "Node {} shut down, released {} sessions",
        presence.node_id(),
        cleaned
    );

    Ok(())
}

fn spawn_relay<F, Fut>(name: &'static str, relay: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(supervise(name, relay))
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", error);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Wait for a presence task and surface both its error and a panic.
pub(crate) async fn settle(task: JoinHandle<Result<()>>) -> Result<()> {
    task.await
        .map_err(|error| RosterError::Internal(error.to_string()))?
}

pub(crate) fn status_for(error: &RosterError) -> StatusCode {
    match error {
        RosterError::UnknownServer(_) | RosterError::Codec(_) => StatusCode::BAD_REQUEST,
        RosterError::UnresolvedIdentity(_) => StatusCode::NOT_FOUND,
        RosterError::Store(_) | RosterError::Bus(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

pub(crate) fn error_response(error: RosterError) -> Response {
    response_error(status_for(&error), error.to_string())
}
