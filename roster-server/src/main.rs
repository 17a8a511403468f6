mod config;
use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;
use server::run_server;

#[derive(Parser)]
#[command(name = "roster")]
#[command(about = "Cluster-wide player presence for stateless proxy nodes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the presence sidecar for one proxy node
    Start {
        /// Path to configuration file
        #[arg(long = "conf", default_value = "config.yaml")]
        conf: String,

        /// Override node_id from config
        #[arg(long)]
        node: Option<String>,
    },
    /// Validate configuration and backend connectivity, then exit
    Check {
        /// Path to configuration file
        #[arg(long = "conf", default_value = "config.yaml")]
        conf: String,
    },
}

fn load_config(path: &str, node: Option<String>) -> Config {
    let mut cfg = match Config::from_file(path) {
        Ok(c) => c,
        Err(error) => {
            tracing::error!("Failed to load config: {}", error);
            std::process::exit(1);
        }
    };

    if let Some(node) = node {
        tracing::info!("Using node override '{}' via CLI", node);
        cfg.node_id = node;
    }

    if let Err(error) = cfg.validate() {
        tracing::error!("Invalid config: {}", error);
        std::process::exit(2);
    }

    if cfg.servers.is_empty() {
        tracing::warn!("No servers configured; server-scoped queries will always be empty");
    }

    cfg
}

async fn run_start(conf: String, node: Option<String>) {
    let cfg = load_config(&conf, node);

    tracing::info!(
        "Node ID: {}, Bind: {}, Policy: {:?}",
        cfg.node_id,
        cfg.bind_addr,
        cfg.presence.kick_policy
    );

    let backend = match cfg.backend_builder().build().await {
        Ok(backend) => backend,
        Err(error) => {
            tracing::error!("Failed to connect backend: {}", error);
            std::process::exit(1);
        }
    };

    if let Err(error) = run_server(cfg, backend).await {
        tracing::error!("Server error: {}", error);
        std::process::exit(1);
    }
}

async fn run_check(conf: String) {
    let cfg = load_config(&conf, None);

    let backend = match cfg.backend_builder().build().await {
        Ok(backend) => backend,
        Err(error) => {
            tracing::error!("Backend unreachable: {}", error);
            std::process::exit(1);
        }
    };

    let nodes = roster_core::NodeRegistry::new(cfg.node_id.clone(), backend.store.clone());
    match nodes.is_id_in_use().await {
        Ok(true) => {
            tracing::error!("Node id '{}' is already live in the cluster", cfg.node_id);
            std::process::exit(2);
        }
        Ok(false) => {}
        Err(error) => {
            tracing::error!("Failed to read node heartbeats: {}", error);
            std::process::exit(1);
        }
    }

    let cluster = roster_core::ClusterView::new(backend.store.clone(), nodes.clone());
    match cluster.orphaned_online_sets().await {
        Ok(orphaned) => {
            for (node_id, online) in orphaned {
                tracing::warn!(
                    "Node {} is down but still lists {} players; restart it to release them",
                    node_id,
                    online
                );
            }
        }
        Err(error) => {
            tracing::error!("Failed to scan online sets: {}", error);
            std::process::exit(1);
        }
    }

    match nodes.live_node_ids().await {
        Ok(live) => tracing::info!(
            "Config OK for node {}; live nodes: {}",
            cfg.node_id,
            live.join(", ")
        ),
        Err(error) => {
            tracing::error!("Failed to list live nodes: {}", error);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roster=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { conf, node } => {
            tracing::info!("Starting Roster with config: {}", conf);
            run_start(conf, node).await;
        }
        Commands::Check { conf } => run_check(conf).await,
    }
}
