//! Inbound listener: accepts client sockets, demuxes HTTP vs SOCKS5 by the
//! first byte, authenticates the client, picks an upstream via the fleet,
//! and hands the connection off to the tunnel splicer.

mod counting;
mod http;
mod socks5;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use proxy_collab::ProcessLookup;
use proxy_fleet::{FleetManager, ListenerRunner, ManagedListener};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use counting::CountingStream;

/// [`ListenerRunner`] implementation backing every [`FleetManager`]'s
/// accept loops. One instance is shared across every listener the manager
/// starts.
pub struct GatewayListenerRunner {
    process_lookup: Arc<dyn ProcessLookup>,
}

impl GatewayListenerRunner {
    pub fn new(process_lookup: Arc<dyn ProcessLookup>) -> Self {
        Self { process_lookup }
    }
}

impl ListenerRunner for GatewayListenerRunner {
    fn start(&self, listener: Arc<ManagedListener>, fleet: FleetManager) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let process_lookup = self.process_lookup.clone();
        Box::pin(async move { run_accept_loop(listener, fleet, process_lookup).await })
    }
}

async fn run_accept_loop(listener: Arc<ManagedListener>, fleet: FleetManager, process_lookup: Arc<dyn ProcessLookup>) {
    let bind_addr = format!("0.0.0.0:{}", listener.requested_port);
    let tcp = match TcpListener::bind(&bind_addr).await {
        Ok(tcp) => tcp,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "failed to bind listener");
            return;
        }
    };

    let bound_port = tcp.local_addr().map(|a| a.port()).unwrap_or(listener.requested_port);
    fleet.mark_listener_bound(&listener, bound_port).await;
    info!(port = bound_port, "listener accepting connections");

    loop {
        tokio::select! {
            _ = listener.cancelled() => {
                info!(port = bound_port, "listener stopped");
                return;
            }
            accepted = tcp.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let listener = listener.clone();
                        let fleet = fleet.clone();
                        let process_lookup = process_lookup.clone();
                        tokio::spawn(async move {
                            if let Some(name) = process_lookup.process_for_peer(peer) {
                                debug!(%peer, process = %name, "inbound connection");
                            } else {
                                debug!(%peer, "inbound connection");
                            }
                            if let Err(e) = handle_connection(stream, listener, fleet).await {
                                debug!(%peer, error = %e, "connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, listener: Arc<ManagedListener>, fleet: FleetManager) -> Result<(), ListenerError> {
    let mut probe = [0u8; 1];
    let n = stream.peek(&mut probe).await?;
    if n == 0 {
        return Ok(());
    }

    let client = CountingStream::new(stream, listener.clone());
    if probe[0] == 0x05 {
        socks5::handle(client, &listener, &fleet).await
    } else {
        http::handle(client, &listener, &fleet).await
    }
}

/// Failures surfaced from a single connection's handling. Never propagated
/// past the spawned task — logged and dropped, same as the teacher's
/// per-connection handlers.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SOCKS5 protocol error: {0}")]
    Socks5(#[from] proxy_protocol::ProtocolError),

    #[error("no upstream available: {0}")]
    Fleet(#[from] proxy_fleet::FleetError),

    #[error("upstream connect failed: {0}")]
    Connect(#[from] proxy_upstream::ConnectError),

    #[error("malformed client request: {0}")]
    ClientProtocol(&'static str),
}
