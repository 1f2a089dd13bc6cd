//! The fleet-owned wrappers around a bare `proxy_upstream::Server` (tags,
//! for selection) and around a listener's configuration (filter, byte
//! counters, a stop signal for its accept loop).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use proxy_protocol::ProxyAuth;
use proxy_upstream::Server;
use tokio::sync::{Notify, RwLock};

use crate::filter::ServerFilter;

/// A `Server` plus the tags the health checker (and the operator) attach to
/// it. Tags have set semantics — a tag is either present or absent.
pub struct ManagedServer {
    pub server: Arc<Server>,
    tags: RwLock<HashSet<String>>,
}

impl ManagedServer {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server, tags: RwLock::new(HashSet::new()) }
    }

    pub fn wrap_direct() -> Self {
        let server = Arc::new(Server::direct());
        let wrapped = Self::new(server);
        wrapped
    }

    pub async fn tags(&self) -> HashSet<String> {
        self.tags.read().await.clone()
    }

    pub async fn add_tag(&self, tag: impl Into<String>) {
        self.tags.write().await.insert(tag.into());
    }

    pub async fn set_tags(&self, tags: HashSet<String>) {
        *self.tags.write().await = tags;
    }

    pub async fn matches(&self, filter: &ServerFilter) -> bool {
        filter.matches(&self.server.id, &self.tags().await)
    }
}

/// A registered local acceptor: its configuration, its accept loop's
/// running/stop state, and cumulative byte counters for observability.
/// The accept loop itself lives in the listener crate; this is the
/// bookkeeping the fleet manager owns across restarts and selection.
pub struct ManagedListener {
    /// Port requested at registration time; 0 means "ask the OS".
    pub requested_port: u16,
    /// Port actually bound, filled in once the accept loop starts.
    pub bound_port: RwLock<Option<u16>>,
    pub auth: Option<ProxyAuth>,
    pub filter: ServerFilter,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    serving: AtomicBool,
    stop: Notify,
}

impl ManagedListener {
    pub fn new(requested_port: u16, auth: Option<ProxyAuth>, filter: ServerFilter) -> Self {
        Self {
            requested_port,
            bound_port: RwLock::new(None),
            auth,
            filter,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            serving: AtomicBool::new(false),
            stop: Notify::new(),
        }
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Relaxed)
    }

    pub fn mark_serving(&self) {
        self.serving.store(true, Ordering::Relaxed);
    }

    pub async fn set_bound_port(&self, port: u16) {
        *self.bound_port.write().await = Some(port);
    }

    pub async fn bound_port(&self) -> Option<u16> {
        *self.bound_port.read().await
    }

    /// Signal this listener's accept loop to stop; does not block for it
    /// to actually exit.
    pub fn cancel(&self) {
        self.serving.store(false, Ordering::Relaxed);
        self.stop.notify_waiters();
    }

    /// Await the cancellation signal. Accept loops race this against
    /// `TcpListener::accept` so a cancel takes effect immediately instead
    /// of waiting for the next inbound connection.
    pub async fn cancelled(&self) {
        self.stop.notified().await;
    }

    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }
}
