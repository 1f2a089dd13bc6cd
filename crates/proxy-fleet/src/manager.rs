//! The process-wide registry of servers and listeners, selection by
//! filter, and the background recheck ticker.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proxy_collab::{GeoLookup, NoGeoLookup};
use proxy_protocol::ProxyAuth;
use proxy_upstream::Server;
use proxy_workerpool::WorkerPool;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::filter::ServerFilter;
use crate::health::CheckServerTask;
use crate::managed::{ManagedListener, ManagedServer};

/// How often the manager re-enqueues a health check for a server that
/// hasn't been checked recently, absent an explicit interval override.
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(60);

/// How often the recheck ticker itself wakes to look for stale servers.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Starts an accept loop for a registered listener. Implemented by the
/// listener crate; kept as a trait object here so this crate never has to
/// depend on it directly.
pub trait ListenerRunner: Send + Sync {
    fn start(&self, listener: Arc<ManagedListener>, fleet: FleetManager) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Configuration a manager is built with.
pub struct FleetConfig {
    pub recheck_interval: Duration,
    pub worker_pool_size: usize,
    pub geo: Arc<dyn GeoLookup>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self { recheck_interval: DEFAULT_RECHECK_INTERVAL, worker_pool_size: 4, geo: Arc::new(NoGeoLookup) }
    }
}

struct Inner {
    listeners: RwLock<HashMap<u16, Arc<ManagedListener>>>,
    /// OS-assigned listeners (`requested_port == 0`) whose real port isn't
    /// known yet, so they can't be keyed into `listeners` by port. Still
    /// surfaced by [`FleetManager::listeners`]; moved into `listeners` once
    /// [`FleetManager::mark_listener_bound`] reports the real port.
    pending_listeners: RwLock<Vec<Arc<ManagedListener>>>,
    servers: RwLock<HashMap<String, Arc<ManagedServer>>>,
    pool: WorkerPool,
    geo: Arc<dyn GeoLookup>,
    recheck_interval: Duration,
    serving: AtomicBool,
    changed: broadcast::Sender<()>,
    runner: RwLock<Option<Arc<dyn ListenerRunner>>>,
}

/// Cheaply cloneable handle to the fleet. Every clone shares the same
/// registries, worker pool, and change-notification channel.
#[derive(Clone)]
pub struct FleetManager {
    inner: Arc<Inner>,
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("no server matches the requested filter")]
    NoMatchingServer,
    #[error("listener port {0} is already registered")]
    DuplicateListener(u16),
    #[error("server {0} is already registered")]
    DuplicateServer(String),
    #[error("failed to bind an OS-assigned port: {0}")]
    PortAllocation(#[source] std::io::Error),
}

impl FleetManager {
    pub fn new(config: FleetConfig) -> Self {
        let (changed, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                listeners: RwLock::new(HashMap::new()),
                pending_listeners: RwLock::new(Vec::new()),
                servers: RwLock::new(HashMap::new()),
                pool: WorkerPool::new(config.worker_pool_size),
                geo: config.geo,
                recheck_interval: config.recheck_interval,
                serving: AtomicBool::new(false),
                changed: changed.clone(),
                runner: RwLock::new(None),
            }),
        }
    }

    /// Subscribe to the `data-changed` event: fires once after any
    /// mutating operation releases its write lock.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.inner.changed.subscribe()
    }

    fn notify_changed(&self) {
        let _ = self.inner.changed.send(());
    }

    /// Wire in the listener crate's accept-loop implementation. Must be
    /// called before [`FleetManager::serve`].
    pub async fn set_runner(&self, runner: Arc<dyn ListenerRunner>) {
        *self.inner.runner.write().await = Some(runner);
    }

    /// Read-only snapshot of every registered server, for display.
    pub async fn servers(&self) -> Vec<Arc<ManagedServer>> {
        self.inner.servers.read().await.values().cloned().collect()
    }

    /// Read-only snapshot of every registered listener, for display —
    /// including OS-assigned listeners still awaiting their real bound
    /// port.
    pub async fn listeners(&self) -> Vec<Arc<ManagedListener>> {
        let mut listeners: Vec<_> = self.inner.listeners.read().await.values().cloned().collect();
        listeners.extend(self.inner.pending_listeners.read().await.iter().cloned());
        listeners
    }

    /// First registered server matching `filter`'s tags and id restriction,
    /// short-circuiting to the `direct` singleton when `filter.ignore_all`.
    pub async fn get_server(&self, filter: &ServerFilter) -> Result<Arc<ManagedServer>, FleetError> {
        if filter.ignore_all {
            return Ok(Arc::new(ManagedServer::wrap_direct()));
        }

        let servers = self.inner.servers.read().await;
        for candidate in servers.values() {
            if candidate.matches(filter).await {
                return Ok(candidate.clone());
            }
        }
        Err(FleetError::NoMatchingServer)
    }

    /// Register a server, enqueue its first health check, and auto-create
    /// its paired route-only-me listener.
    pub async fn add_server(&self, server: Server) -> Result<Arc<ManagedServer>, FleetError> {
        let id = server.id.clone();
        let managed = Arc::new(ManagedServer::new(Arc::new(server)));

        {
            let mut servers = self.inner.servers.write().await;
            if servers.contains_key(&id) {
                return Err(FleetError::DuplicateServer(id));
            }
            servers.insert(id.clone(), managed.clone());
        }

        self.enqueue_check(managed.clone());
        self.add_listener_internal(0, None, ServerFilter::by_server_id(id)).await?;
        self.notify_changed();
        Ok(managed)
    }

    /// Drop a server from the registry and tear down its connector state.
    pub async fn remove_server(&self, id: &str) {
        let removed = self.inner.servers.write().await.remove(id);
        if let Some(managed) = removed {
            managed.server.cleanup().await;
            self.notify_changed();
        }
    }

    /// Register a listener with an explicit port (0 = ask the OS) and
    /// optional client-side credentials.
    pub async fn add_listener(&self, port: u16, auth: Option<ProxyAuth>, filter: ServerFilter) -> Result<Arc<ManagedListener>, FleetError> {
        let listener = self.add_listener_internal(port, auth, filter).await?;
        self.notify_changed();
        Ok(listener)
    }

    async fn add_listener_internal(&self, port: u16, auth: Option<ProxyAuth>, filter: ServerFilter) -> Result<Arc<ManagedListener>, FleetError> {
        let listener = Arc::new(ManagedListener::new(port, auth, filter));

        if port != 0 {
            let mut listeners = self.inner.listeners.write().await;
            if listeners.contains_key(&port) {
                return Err(FleetError::DuplicateListener(port));
            }
            listeners.insert(port, listener.clone());
        } else {
            // Keyed by requested port 0 isn't unique, so OS-assigned
            // listeners are tracked in `pending_listeners` — still visible
            // via `listeners()` — until `mark_listener_bound` re-keys them
            // into `listeners` by their real bound port.
            self.inner.pending_listeners.write().await.push(listener.clone());
        }

        if self.inner.serving.load(Ordering::Relaxed) {
            self.start_listener(listener.clone()).await;
        }

        Ok(listener)
    }

    /// Called by the listener crate's accept loop once an OS-assigned
    /// listener has actually bound and learned its real port: moves it out
    /// of `pending_listeners` and into `listeners`, keyed by that port, so
    /// it becomes visible and removable the same way an explicit-port
    /// listener is. A no-op for explicit-port listeners, which are already
    /// keyed correctly from registration.
    pub async fn mark_listener_bound(&self, listener: &Arc<ManagedListener>, port: u16) {
        listener.set_bound_port(port).await;
        if listener.requested_port != 0 {
            return;
        }

        let mut pending = self.inner.pending_listeners.write().await;
        pending.retain(|candidate| !Arc::ptr_eq(candidate, listener));
        drop(pending);

        self.inner.listeners.write().await.insert(port, listener.clone());
    }

    /// Cancel a listener's accept loop and drop it from the registry.
    pub async fn remove_listener(&self, port: u16) {
        let removed = self.inner.listeners.write().await.remove(&port);
        if let Some(listener) = removed {
            listener.cancel();
            self.notify_changed();
        }
    }

    /// Immediately enqueue a health check for `id`, ignoring the recheck
    /// interval.
    pub async fn recheck_server(&self, id: &str) -> Result<(), FleetError> {
        let managed = self.inner.servers.read().await.get(id).cloned().ok_or(FleetError::NoMatchingServer)?;
        self.enqueue_check(managed);
        Ok(())
    }

    fn enqueue_check(&self, managed: Arc<ManagedServer>) {
        let pool = self.inner.pool.clone();
        let geo = self.inner.geo.clone();
        tokio::spawn(async move {
            pool.add_task(CheckServerTask { managed, geo }).await;
        });
    }

    /// Start accept loops for every non-serving listener and the
    /// background recheck ticker. Requires [`FleetManager::set_runner`] to
    /// have been called first.
    pub async fn serve(&self) {
        self.inner.serving.store(true, Ordering::Relaxed);

        let listeners: Vec<_> = self.inner.listeners.read().await.values().cloned().collect();
        for listener in listeners {
            if !listener.is_serving() {
                self.start_listener(listener).await;
            }
        }

        let fleet = self.clone();
        tokio::spawn(async move { fleet.recheck_loop().await });
    }

    async fn start_listener(&self, listener: Arc<ManagedListener>) {
        let runner = self.inner.runner.read().await.clone();
        let Some(runner) = runner else {
            warn!("no listener runner configured, cannot start accept loop");
            return;
        };
        listener.mark_serving();
        let fleet = self.clone();
        tokio::spawn(runner.start(listener, fleet));
    }

    async fn recheck_loop(&self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            let servers: Vec<_> = self.inner.servers.read().await.values().cloned().collect();
            for managed in servers {
                let stale = match managed.server.last_checked().await {
                    None => true,
                    Some(last) => last.elapsed() >= self.inner.recheck_interval,
                };
                if stale {
                    self.enqueue_check(managed);
                }
            }
        }
    }
}

/// Best-effort local address discovery: open a UDP socket "toward"
/// `8.8.8.8:80` and read back the address the OS picked for it. Never
/// actually sends a packet.
pub async fn local_ip() -> String {
    match local_ip_inner().await {
        Ok(ip) => ip,
        Err(_) => "localhost".to_string(),
    }
}

async fn local_ip_inner() -> std::io::Result<String> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    Ok(socket.local_addr()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FleetConfig {
        FleetConfig { recheck_interval: Duration::from_secs(60), worker_pool_size: 0, geo: Arc::new(NoGeoLookup) }
    }

    #[tokio::test]
    async fn ignore_all_filter_resolves_to_direct_singleton() {
        let fleet = FleetManager::new(config());
        let server = fleet.get_server(&ServerFilter::ignore_all()).await.unwrap();
        assert_eq!(server.server.id, "direct");
    }

    #[tokio::test]
    async fn no_match_returns_error() {
        let fleet = FleetManager::new(config());
        let err = fleet.get_server(&ServerFilter::by_server_id("missing")).await.unwrap_err();
        assert!(matches!(err, FleetError::NoMatchingServer));
    }

    #[tokio::test]
    async fn add_server_registers_it_and_its_route_only_listener() {
        let fleet = FleetManager::new(config());
        fleet.add_server(Server::new("s1", "127.0.0.1", 1080, None)).await.unwrap();

        let server = fleet.get_server(&ServerFilter::by_server_id("s1")).await.unwrap();
        assert_eq!(server.server.id, "s1");

        let listeners = fleet.listeners().await;
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].requested_port, 0);
        assert!(listeners[0].filter.server_ids.contains(&"s1".to_string()));
    }

    #[tokio::test]
    async fn os_assigned_listener_becomes_removable_once_bound() {
        let fleet = FleetManager::new(config());
        let listener = fleet.add_listener(0, None, ServerFilter::default()).await.unwrap();
        assert_eq!(fleet.listeners().await.len(), 1);

        fleet.mark_listener_bound(&listener, 54321).await;
        assert_eq!(fleet.listeners().await.len(), 1);
        assert_eq!(listener.bound_port().await, Some(54321));

        fleet.remove_listener(54321).await;
        assert_eq!(fleet.listeners().await.len(), 0);
    }

    #[tokio::test]
    async fn remove_server_drops_it_from_selection() {
        let fleet = FleetManager::new(config());
        fleet.add_server(Server::new("s1", "127.0.0.1", 1080, None)).await.unwrap();
        fleet.remove_server("s1").await;

        let err = fleet.get_server(&ServerFilter::by_server_id("s1")).await.unwrap_err();
        assert!(matches!(err, FleetError::NoMatchingServer));
    }

    #[tokio::test]
    async fn duplicate_server_id_is_rejected() {
        let fleet = FleetManager::new(config());
        fleet.add_server(Server::new("s1", "127.0.0.1", 1080, None)).await.unwrap();
        let err = fleet.add_server(Server::new("s1", "127.0.0.1", 1081, None)).await.unwrap_err();
        assert!(matches!(err, FleetError::DuplicateServer(_)));
    }

    #[tokio::test]
    async fn change_notifications_fire_on_mutation() {
        let fleet = FleetManager::new(config());
        let mut rx = fleet.subscribe();
        fleet.add_server(Server::new("s1", "127.0.0.1", 1080, None)).await.unwrap();
        tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.unwrap().unwrap();
    }
}
