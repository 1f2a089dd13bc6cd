//! The `CheckServer` task: probes every non-direct protocol a server might
//! speak against `api.ipify.org`, records which ones answered, and tags the
//! server with its reported public IP's country.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use proxy_collab::GeoLookup;
use proxy_upstream::{ProtocolKind, Server};
use proxy_workerpool::Task;
use tracing::debug;

use crate::managed::ManagedServer;

/// The host every health check probes. A server that can reach this over
/// a given protocol is assumed able to reach anything else over it too.
const IP_CHECK_HOST: &str = "api.ipify.org";
const IP_CHECK_TARGET: &str = "api.ipify.org:80";

/// Dedup-keyed by server id, so the recheck loop and a manual
/// `RecheckServer` call never run two checks for the same server at once.
pub struct CheckServerTask {
    pub managed: Arc<ManagedServer>,
    pub geo: Arc<dyn GeoLookup>,
}

impl Task for CheckServerTask {
    fn key(&self) -> String {
        format!("check:{}", self.managed.server.id)
    }

    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            run_check(&self.managed, self.geo.as_ref()).await;
        })
    }
}

async fn run_check(managed: &ManagedServer, geo: &dyn GeoLookup) {
    let server = &managed.server;
    let start = Instant::now();

    let (http_ip, socks5_ip, ssh_ip) = tokio::join!(
        probe_kind(server, ProtocolKind::Http),
        probe_kind(server, ProtocolKind::Socks5),
        probe_kind(server, ProtocolKind::Ssh),
    );

    let mut any_ip = None;
    for (kind, ip) in [
        (ProtocolKind::Http, &http_ip),
        (ProtocolKind::Socks5, &socks5_ip),
        (ProtocolKind::Ssh, &ssh_ip),
    ] {
        let supported = ip.is_some();
        server.set_capability(kind, supported).await;
        if supported {
            managed.add_tag(kind.as_tag()).await;
            any_ip = any_ip.or_else(|| ip.clone());
        }
    }

    let latency = if any_ip.is_some() { start.elapsed() } else { Duration::ZERO };
    server.set_latency(latency).await;

    if let Some(ip) = any_ip {
        server.set_public_ip(ip.clone()).await;
        if let Some(country) = geo.country_for_ip(&ip) {
            managed.add_tag(country).await;
        }
    }

    server.mark_checked_now().await;
    debug!(server = %server.id, latency_ms = %latency.as_millis(), "health check complete");
}

/// Probe one protocol kind in isolation: a throwaway `Server` carrying only
/// that capability, so the probe can't disturb the shared server's state
/// while live traffic may be using it.
async fn probe_kind(server: &Server, kind: ProtocolKind) -> Option<String> {
    if kind == ProtocolKind::Ssh && server.auth.is_none() {
        return None;
    }

    let probe = Server::new(format!("{}-probe", server.id), &server.host, server.port, server.auth.clone());
    probe.set_capability(kind, true).await;

    if probe.prepare().await.is_err() {
        return None;
    }

    let tunnel = probe.connect(IP_CHECK_TARGET).await.ok()?;
    let request = format!("GET / HTTP/1.1\r\nHost: {IP_CHECK_HOST}\r\nConnection: close\r\n\r\n");
    let response = proxy_upstream::request_response(tunnel, request.as_bytes()).await.ok()?;
    probe.cleanup().await;

    parse_ip_from_response(&response)
}

fn parse_ip_from_response(response: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(response);
    let body = text.split("\r\n\r\n").nth(1)?;
    let ip = body.trim();
    if ip.is_empty() { None } else { Some(ip.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_body_after_header_block() {
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\n203.0.113.5";
        assert_eq!(parse_ip_from_response(response).as_deref(), Some("203.0.113.5"));
    }

    #[test]
    fn empty_body_yields_none() {
        let response = b"HTTP/1.1 200 OK\r\n\r\n";
        assert_eq!(parse_ip_from_response(response), None);
    }
}
