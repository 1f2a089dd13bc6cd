//! The configured upstream proxy (or the `direct` sentinel) and its
//! connect/prepare/cleanup lifecycle.
//!
//! A server can claim support for more than one protocol at once (the
//! health checker probes all of them independently), but only ever dials
//! through one per connection — the first it supports in the fixed
//! preference order `http > socks5 > ssh > direct`. That precedence check
//! is the one place this crate would, in a less fortunate language, need a
//! `switch true { case a: ...; case b: ... }` over a handful of booleans;
//! here it's a match over an enum instead.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use proxy_protocol::{socks5, AuthStatus, CommandReply, ProxyAuth, ReplyCode, Socks5Address};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::ssh::SshSession;
use crate::tunnel::Tunnel;

/// Default timeout for dials and SSH handshakes when a `Server` doesn't
/// override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One of the four things a `Server` can know how to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Http,
    Socks5,
    Ssh,
    Direct,
}

impl ProtocolKind {
    /// Precedence used by [`Server::connect`] and the health checker's
    /// per-kind iteration.
    pub const PREFERENCE_ORDER: [ProtocolKind; 4] =
        [ProtocolKind::Http, ProtocolKind::Socks5, ProtocolKind::Ssh, ProtocolKind::Direct];

    pub fn as_tag(&self) -> &'static str {
        match self {
            ProtocolKind::Http => "http",
            ProtocolKind::Socks5 => "socks5",
            ProtocolKind::Ssh => "ssh",
            ProtocolKind::Direct => "direct",
        }
    }
}

/// Which protocols a `Server` is currently believed to support. Set
/// directly at construction from known configuration, and refreshed by the
/// fleet's periodic health check.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerCapabilities {
    pub http: bool,
    pub socks5: bool,
    pub ssh: bool,
    pub direct: bool,
}

impl ServerCapabilities {
    pub fn get(&self, kind: ProtocolKind) -> bool {
        match kind {
            ProtocolKind::Http => self.http,
            ProtocolKind::Socks5 => self.socks5,
            ProtocolKind::Ssh => self.ssh,
            ProtocolKind::Direct => self.direct,
        }
    }

    pub fn set(&mut self, kind: ProtocolKind, supported: bool) {
        match kind {
            ProtocolKind::Http => self.http = supported,
            ProtocolKind::Socks5 => self.socks5 = supported,
            ProtocolKind::Ssh => self.ssh = supported,
            ProtocolKind::Direct => self.direct = supported,
        }
    }

    /// The first supported kind in [`ProtocolKind::PREFERENCE_ORDER`].
    pub fn preferred(&self) -> Option<ProtocolKind> {
        ProtocolKind::PREFERENCE_ORDER.into_iter().find(|k| self.get(*k))
    }

    /// The `direct` singleton: no proxying, just a raw dial.
    pub fn direct_only() -> Self {
        Self { direct: true, ..Default::default() }
    }
}

/// An upstream proxy (or the `direct` sentinel). Shared via `Arc` across
/// the listener handlers that use it and the health checker that mutates
/// its capability/latency/public-IP fields.
pub struct Server {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub auth: Option<ProxyAuth>,
    pub timeout: Duration,

    capabilities: RwLock<ServerCapabilities>,
    ssh_session: Mutex<Option<SshSession>>,
    public_ip: RwLock<String>,
    latency: RwLock<Duration>,
    last_checked: RwLock<Option<Instant>>,
}

impl Server {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16, auth: Option<ProxyAuth>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            auth,
            timeout: DEFAULT_TIMEOUT,
            capabilities: RwLock::new(ServerCapabilities::default()),
            ssh_session: Mutex::new(None),
            public_ip: RwLock::new(String::new()),
            latency: RwLock::new(Duration::ZERO),
            last_checked: RwLock::new(None),
        }
    }

    /// The `direct` singleton every `IgnoreAll` filter resolves to: no
    /// upstream, just a raw TCP dial from the gateway's own host.
    pub fn direct() -> Self {
        let mut server = Self::new("direct", "127.0.0.1", 0, None);
        server.capabilities = RwLock::new(ServerCapabilities::direct_only());
        server
    }

    pub async fn capabilities(&self) -> ServerCapabilities {
        *self.capabilities.read().await
    }

    pub async fn set_capability(&self, kind: ProtocolKind, supported: bool) {
        self.capabilities.write().await.set(kind, supported);
    }

    pub async fn public_ip(&self) -> String {
        self.public_ip.read().await.clone()
    }

    pub async fn set_public_ip(&self, ip: String) {
        *self.public_ip.write().await = ip;
    }

    pub async fn latency(&self) -> Duration {
        *self.latency.read().await
    }

    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.write().await = latency;
    }

    pub async fn last_checked(&self) -> Option<Instant> {
        *self.last_checked.read().await
    }

    pub async fn mark_checked_now(&self) {
        *self.last_checked.write().await = Some(Instant::now());
    }

    async fn active_kind(&self) -> Result<ProtocolKind, ConnectError> {
        self.capabilities.read().await.preferred().ok_or_else(|| ConnectError::NoSupportedProtocol {
            server: self.id.clone(),
        })
    }

    /// Establish whatever session state the active protocol needs. A no-op
    /// for every variant except SSH.
    pub async fn prepare(&self) -> Result<(), ConnectError> {
        if self.active_kind().await? == ProtocolKind::Ssh {
            self.prepare_ssh().await?;
        }
        Ok(())
    }

    pub async fn is_prepared(&self) -> bool {
        match self.active_kind().await {
            Ok(ProtocolKind::Ssh) => self.ssh_session.lock().await.is_some(),
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Connect to `target` ("host:port") through whichever protocol this
    /// server prefers. Retries once, by re-preparing, if the SSH variant
    /// observes its cached session is stale.
    pub async fn connect(&self, target: &str) -> Result<Tunnel, ConnectError> {
        match self.active_kind().await? {
            ProtocolKind::Http => self.connect_http(target).await,
            ProtocolKind::Socks5 => self.connect_socks5(target).await,
            ProtocolKind::Ssh => self.connect_ssh(target).await,
            ProtocolKind::Direct => self.connect_direct(target).await,
        }
    }

    pub async fn cleanup(&self) {
        if let Some(session) = self.ssh_session.lock().await.take() {
            session.close().await;
        }
    }

    async fn connect_direct(&self, target: &str) -> Result<Tunnel, ConnectError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(target))
            .await
            .map_err(|_| ConnectError::Timeout { target: target.to_string() })?
            .map_err(|e| ConnectError::Io { target: target.to_string(), source: e })?;
        Ok(Tunnel::Stream(stream))
    }

    async fn dial_self(&self) -> Result<TcpStream, ConnectError> {
        let addr = format!("{}:{}", self.host, self.port);
        tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectError::Timeout { target: addr.clone() })?
            .map_err(|e| ConnectError::Io { target: addr, source: e })
    }

    async fn connect_http(&self, target: &str) -> Result<Tunnel, ConnectError> {
        let mut stream = self.dial_self().await?;

        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(auth) = &self.auth {
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", auth.to_base64()));
        }
        request.push_str("\r\n");

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ConnectError::Io { target: target.to_string(), source: e })?;

        let status_line = read_http_status_line(&mut stream)
            .await
            .map_err(|e| ConnectError::Io { target: target.to_string(), source: e })?;

        if !status_line.contains(" 200 ") && !status_line.ends_with(" 200") {
            return Err(ConnectError::UpstreamRefused {
                target: target.to_string(),
                reason: status_line,
            });
        }

        Ok(Tunnel::Stream(stream))
    }

    async fn connect_socks5(&self, target: &str) -> Result<Tunnel, ConnectError> {
        let mut stream = self.dial_self().await?;
        let io_err = |e: std::io::Error| ConnectError::Io { target: target.to_string(), source: e };

        let method = if self.auth.is_some() { socks5::AuthMethod::UserPass } else { socks5::AuthMethod::NoAuth };
        stream.write_all(&[0x05, 0x01, method_byte(method)]).await.map_err(io_err)?;

        let mut select = [0u8; 2];
        stream.read_exact(&mut select).await.map_err(io_err)?;
        if select[1] == 0xFF {
            return Err(ConnectError::UpstreamAuthFailed { target: target.to_string() });
        }

        if method == socks5::AuthMethod::UserPass {
            let auth = self.auth.as_ref().expect("UserPass only chosen when auth is set");
            socks5::write_user_pass(&mut stream, &auth.username, &auth.password).await.map_err(|e| {
                ConnectError::UpstreamRefused { target: target.to_string(), reason: e.to_string() }
            })?;
            let status = socks5::read_user_pass_reply(&mut stream).await.map_err(|e| {
                ConnectError::UpstreamRefused { target: target.to_string(), reason: e.to_string() }
            })?;
            if status != AuthStatus::Success {
                return Err(ConnectError::UpstreamAuthFailed { target: target.to_string() });
            }
        }

        let (host, port) = split_host_port(target)?;
        let address = Socks5Address::from_host(&host);
        socks5::write_connect_request(&mut stream, &address, port)
            .await
            .map_err(|e| ConnectError::Io { target: target.to_string(), source: to_io(e) })?;

        let reply: CommandReply = socks5::read_reply(&mut stream)
            .await
            .map_err(|e| ConnectError::Io { target: target.to_string(), source: to_io(e) })?;

        if reply.code != ReplyCode::Succeeded {
            return Err(ConnectError::UpstreamRefused {
                target: target.to_string(),
                reason: format!("{:?}", reply.code),
            });
        }

        Ok(Tunnel::Stream(stream))
    }

    async fn prepare_ssh(&self) -> Result<(), ConnectError> {
        let mut guard = self.ssh_session.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let auth = self.auth.as_ref().ok_or_else(|| ConnectError::UpstreamPrepareFailed {
            target: self.id.clone(),
            reason: "SSH server has no configured credentials".to_string(),
        })?;
        let session = SshSession::connect(&self.host, self.port, &auth.username, &auth.password, self.timeout)
            .await?;
        *guard = Some(session);
        Ok(())
    }

    async fn connect_ssh(&self, target: &str) -> Result<Tunnel, ConnectError> {
        self.prepare_ssh().await?;
        let (host, port) = split_host_port(target)?;

        let first_attempt = {
            let guard = self.ssh_session.lock().await;
            let session = guard.as_ref().expect("just prepared");
            session.open_direct_tcpip(&host, port).await
        };

        match first_attempt {
            Ok(channel) => Ok(Tunnel::Ssh(channel)),
            Err(_) => {
                debug!(server = %self.id, "SSH session looked stale, re-preparing once");
                *self.ssh_session.lock().await = None;
                self.prepare_ssh().await?;
                let guard = self.ssh_session.lock().await;
                let session = guard.as_ref().expect("just re-prepared");
                let channel = session.open_direct_tcpip(&host, port).await?;
                Ok(Tunnel::Ssh(channel))
            }
        }
    }
}

fn method_byte(method: socks5::AuthMethod) -> u8 {
    match method {
        socks5::AuthMethod::NoAuth => 0x00,
        socks5::AuthMethod::UserPass => 0x02,
        socks5::AuthMethod::NoAcceptableMethod => 0xFF,
    }
}

fn to_io(e: proxy_protocol::ProtocolError) -> std::io::Error {
    match e {
        proxy_protocol::ProtocolError::Io(io) => io,
        other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
    }
}

fn split_host_port(target: &str) -> Result<(String, u16), ConnectError> {
    let (host, port) = target.rsplit_once(':').ok_or_else(|| ConnectError::InvalidTarget { target: target.to_string() })?;
    let port: u16 = port.parse().map_err(|_| ConnectError::InvalidTarget { target: target.to_string() })?;
    Ok((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
}

async fn read_http_status_line(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
    }
    // Drain the rest of the header block up to the blank line.
    let mut prev_two = [0u8; 2];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' && prev_two == [b'\r', b'\n'] {
            break;
        }
        prev_two[0] = prev_two[1];
        prev_two[1] = byte[0];
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Failures from any of the four connector variants, each carrying the
/// target they were trying to reach for diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("server {server} has no supported protocol configured")]
    NoSupportedProtocol { server: String },

    #[error("target {target} could not be parsed as host:port")]
    InvalidTarget { target: String },

    #[error("connect to {target} timed out")]
    Timeout { target: String },

    #[error("upstream refused {target}: {reason}")]
    UpstreamRefused { target: String, reason: String },

    #[error("upstream authentication failed for {target}")]
    UpstreamAuthFailed { target: String },

    #[error("failed to prepare upstream for {target}: {reason}")]
    UpstreamPrepareFailed { target: String, reason: String },

    #[error("IO error connecting to {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preference_order_is_http_then_socks5_then_ssh_then_direct() {
        let mut caps = ServerCapabilities::default();
        assert_eq!(caps.preferred(), None);

        caps.set(ProtocolKind::Direct, true);
        assert_eq!(caps.preferred(), Some(ProtocolKind::Direct));

        caps.set(ProtocolKind::Ssh, true);
        assert_eq!(caps.preferred(), Some(ProtocolKind::Ssh));

        caps.set(ProtocolKind::Socks5, true);
        assert_eq!(caps.preferred(), Some(ProtocolKind::Socks5));

        caps.set(ProtocolKind::Http, true);
        assert_eq!(caps.preferred(), Some(ProtocolKind::Http));
    }

    #[test]
    fn split_host_port_handles_bracketed_v6() {
        let (host, port) = split_host_port("[::1]:9001").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 9001);
    }

    #[tokio::test]
    async fn direct_singleton_only_supports_direct() {
        let server = Server::direct();
        assert_eq!(server.capabilities().await.preferred(), Some(ProtocolKind::Direct));
    }

    #[tokio::test]
    async fn connect_with_no_capability_fails_fast() {
        let server = Server::new("s1", "127.0.0.1", 9, None);
        let err = server.connect("example.com:80").await.unwrap_err();
        assert!(matches!(err, ConnectError::NoSupportedProtocol { .. }));
    }
}
