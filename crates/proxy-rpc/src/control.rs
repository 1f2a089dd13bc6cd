//! The operations a local front-end drives the fleet with: state, a
//! display snapshot, add/delete for servers and listeners, an on-demand
//! recheck, and bulk import from a delimited proxy list.

use std::sync::atomic::Ordering;

use proxy_fleet::{FleetError, FleetManager, ServerFilter};
use proxy_protocol::ProxyAuth;
use proxy_upstream::Server;
use tracing::info;

use crate::import;
use crate::types::{
    CapabilitySnapshot, ImportOptions, ListenerSnapshot, ListenerSpec, ManagerSnapshot, ServerSnapshot, ServerSpec,
    StateResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Fleet(#[from] FleetError),
}

/// Thin wrapper around a [`FleetManager`] exposing the shape a UI or shell
/// front-end calls into.
pub struct ControlSurface {
    fleet: FleetManager,
}

impl ControlSurface {
    pub fn new(fleet: FleetManager) -> Self {
        Self { fleet }
    }

    pub async fn get_state(&self) -> StateResponse {
        StateResponse { local_ip: proxy_fleet::local_ip().await }
    }

    pub async fn get_manager(&self) -> ManagerSnapshot {
        let mut servers = Vec::new();
        for managed in self.fleet.servers().await {
            let caps = managed.server.capabilities().await;
            servers.push(ServerSnapshot {
                id: managed.server.id.clone(),
                host: managed.server.host.clone(),
                port: managed.server.port,
                capabilities: CapabilitySnapshot { http: caps.http, socks5: caps.socks5, ssh: caps.ssh, direct: caps.direct },
                public_ip: managed.server.public_ip().await,
                latency_ms: managed.server.latency().await.as_millis(),
                tags: managed.tags().await.into_iter().collect(),
            });
        }

        let mut listeners = Vec::new();
        for listener in self.fleet.listeners().await {
            listeners.push(ListenerSnapshot {
                requested_port: listener.requested_port,
                bound_port: listener.bound_port().await,
                bytes_sent: listener.bytes_sent.load(Ordering::Relaxed),
                bytes_received: listener.bytes_received.load(Ordering::Relaxed),
                serving: listener.is_serving(),
            });
        }

        ManagerSnapshot { servers, listeners }
    }

    pub async fn add_servers(&self, specs: Vec<ServerSpec>) -> Result<(), RpcError> {
        for spec in specs {
            let auth = credentials(spec.username, spec.password);
            info!(id = %spec.id, host = %spec.host, port = spec.port, "adding server");
            self.fleet.add_server(Server::new(spec.id, spec.host, spec.port, auth)).await?;
        }
        Ok(())
    }

    pub async fn delete_servers(&self, ids: Vec<String>) {
        for id in ids {
            self.fleet.remove_server(&id).await;
        }
    }

    pub async fn add_listeners(&self, specs: Vec<ListenerSpec>) -> Result<(), RpcError> {
        for spec in specs {
            let auth = credentials(spec.username, spec.password);
            let filter = if spec.ignore_all {
                ServerFilter::ignore_all()
            } else {
                ServerFilter { tags: spec.tags, server_ids: spec.server_ids, ignore_all: false }
            };
            self.fleet.add_listener(spec.port, auth, filter).await?;
        }
        Ok(())
    }

    pub async fn delete_listeners(&self, ports: Vec<u16>) {
        for port in ports {
            self.fleet.remove_listener(port).await;
        }
    }

    pub async fn recheck_server(&self, id: &str) -> Result<(), RpcError> {
        self.fleet.recheck_server(id).await.map_err(Into::into)
    }

    /// Parse `content` per `options` and add every resulting row as a
    /// server. Returns the number of servers added.
    pub async fn import_proxy_file(&self, content: &str, options: ImportOptions) -> Result<usize, RpcError> {
        let specs = import::parse(content, &options);
        let added = specs.len();
        self.add_servers(specs).await?;
        Ok(added)
    }
}

fn credentials(username: Option<String>, password: Option<String>) -> Option<ProxyAuth> {
    match (username, password) {
        (Some(u), Some(p)) => Some(ProxyAuth::new(u, p)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_collab::NoGeoLookup;
    use proxy_fleet::FleetConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn surface() -> ControlSurface {
        let fleet = FleetManager::new(FleetConfig {
            recheck_interval: Duration::from_secs(60),
            worker_pool_size: 0,
            geo: Arc::new(NoGeoLookup),
        });
        ControlSurface::new(fleet)
    }

    #[tokio::test]
    async fn get_state_never_fails() {
        let state = surface().get_state().await;
        assert!(!state.local_ip.is_empty());
    }

    #[tokio::test]
    async fn add_and_delete_server_round_trips() {
        let surface = surface();
        surface
            .add_servers(vec![ServerSpec { id: "s1".into(), host: "127.0.0.1".into(), port: 1080, username: None, password: None }])
            .await
            .unwrap();

        let snapshot = surface.get_manager().await;
        assert_eq!(snapshot.servers.len(), 1);

        surface.delete_servers(vec!["s1".into()]).await;
        let snapshot = surface.get_manager().await;
        assert_eq!(snapshot.servers.len(), 0);
    }

    #[tokio::test]
    async fn import_proxy_file_adds_every_row() {
        let surface = surface();
        let options = ImportOptions { separator: ',', skip_cols: 0, default_port: 1080, skip_header: false };
        let added = surface.import_proxy_file("1.2.3.4,9090\n5.6.7.8,9091", options).await.unwrap();
        assert_eq!(added, 2);
        assert_eq!(surface.get_manager().await.servers.len(), 2);
    }
}
