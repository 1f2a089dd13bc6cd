//! fOS proxy gateway: loads a fleet configuration, wires the listener and
//! collaborator implementations into a `FleetManager`, and serves until
//! interrupted.

mod config;

use std::sync::Arc;

use anyhow::Result;
use proxy_collab::{GeoLookup, MaxmindGeoLookup, NoGeoLookup, SystemProcessLookup};
use proxy_fleet::{FleetConfig, FleetManager, ServerFilter};
use proxy_listener::GatewayListenerRunner;
use proxy_protocol::ProxyAuth;
use proxy_upstream::Server;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::GatewayConfig;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "proxy_app=info,proxy_fleet=info,proxy_listener=info".into()))
        .init();

    info!("proxy gateway starting...");

    let config = load_config();
    let geo = load_geo(&config);

    let fleet = FleetManager::new(FleetConfig {
        recheck_interval: config.recheck_interval(),
        worker_pool_size: config.worker_pool_size,
        geo,
    });

    let runner = Arc::new(GatewayListenerRunner::new(Arc::new(SystemProcessLookup::new())));
    fleet.set_runner(runner).await;

    seed(&fleet, &config).await;

    fleet.serve().await;
    info!("fleet serving, local address: {}", proxy_fleet::local_ip().await);

    tokio::signal::ctrl_c().await?;
    info!("proxy gateway shutting down");
    Ok(())
}

fn load_config() -> GatewayConfig {
    match std::env::args().nth(1) {
        Some(path) => match GatewayConfig::from_toml_file(&path) {
            Ok(config) => {
                info!(path = %path, "loaded configuration");
                config
            }
            Err(e) => {
                error!(path = %path, error = %e, "failed to load configuration, falling back to defaults");
                GatewayConfig::default_config()
            }
        },
        None => {
            info!("no configuration file given, using defaults");
            GatewayConfig::default_config()
        }
    }
}

fn load_geo(config: &GatewayConfig) -> Arc<dyn GeoLookup> {
    match &config.geo_database_path {
        Some(path) => match MaxmindGeoLookup::open(path) {
            Ok(geo) => Arc::new(geo),
            Err(e) => {
                warn!(path = %path, error = %e, "failed to open geo database, geo-tagging disabled");
                Arc::new(NoGeoLookup)
            }
        },
        None => Arc::new(NoGeoLookup),
    }
}

async fn seed(fleet: &FleetManager, config: &GatewayConfig) {
    for server in &config.servers {
        let auth = credentials(server.username.clone(), server.password.clone());
        match fleet.add_server(Server::new(server.id.clone(), server.host.clone(), server.port, auth)).await {
            Ok(managed) => {
                for tag in &server.tags {
                    managed.add_tag(tag.clone()).await;
                }
            }
            Err(e) => error!(id = %server.id, error = %e, "failed to add configured server"),
        }
    }

    for listener in &config.listeners {
        let auth = credentials(listener.username.clone(), listener.password.clone());
        let filter = if listener.ignore_all {
            ServerFilter::ignore_all()
        } else {
            ServerFilter { tags: listener.tags.clone(), server_ids: listener.server_ids.clone(), ignore_all: false }
        };
        if let Err(e) = fleet.add_listener(listener.port, auth, filter).await {
            error!(port = listener.port, error = %e, "failed to add configured listener");
        }
    }
}

fn credentials(username: Option<String>, password: Option<String>) -> Option<ProxyAuth> {
    match (username, password) {
        (Some(u), Some(p)) => Some(ProxyAuth::new(u, p)),
        _ => None,
    }
}
