//! SSH client session used by the SSH upstream variant: a password-
//! authenticated `russh` session that opens `direct-tcpip` channels on
//! demand, plus the hand-rolled relay loop that bridges one such channel
//! to a plain byte stream (russh channels are not `AsyncRead`/`AsyncWrite`,
//! so they can't go through the generic splicer).

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::server::ConnectError;

/// Accepts every host key. The upstream fleet here is a curated pool of
/// proxies the operator already chose by host:port, not an interactive SSH
/// client asking a human to verify a fingerprint.
struct InsecureHandler;

impl client::Handler for InsecureHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A live SSH client session to one upstream `Server`.
pub struct SshSession {
    handle: Handle<InsecureHandler>,
}

impl SshSession {
    /// Connect and authenticate with a password. Fails as
    /// [`ConnectError::UpstreamPrepareFailed`] on any dial, handshake, or
    /// auth failure.
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let addr = format!("{host}:{port}");
        let config = Arc::new(client::Config::default());

        let mut handle = tokio::time::timeout(timeout, client::connect(config, (host, port), InsecureHandler))
            .await
            .map_err(|_| ConnectError::UpstreamPrepareFailed {
                target: addr.clone(),
                reason: "SSH connect timed out".into(),
            })?
            .map_err(|e| ConnectError::UpstreamPrepareFailed { target: addr.clone(), reason: e.to_string() })?;

        let authenticated = handle
            .authenticate_password(username, password)
            .await
            .map_err(|e| ConnectError::UpstreamPrepareFailed { target: addr.clone(), reason: e.to_string() })?;

        if !authenticated {
            return Err(ConnectError::UpstreamAuthFailed { target: addr });
        }

        debug!(%addr, "SSH session established");
        Ok(Self { handle })
    }

    /// Open a `direct-tcpip` channel to `target_host:target_port`. The
    /// originator address is reported as `127.0.0.1:0` since the gateway
    /// has no meaningful bind address of its own to offer.
    pub async fn open_direct_tcpip(
        &self,
        target_host: &str,
        target_port: u16,
    ) -> Result<Channel<client::Msg>, ConnectError> {
        self.handle
            .channel_open_direct_tcpip(target_host, target_port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| ConnectError::UpstreamRefused {
                target: format!("{target_host}:{target_port}"),
                reason: e.to_string(),
            })
    }

    pub async fn close(&self) {
        let _ = self.handle.disconnect(russh::Disconnect::ByApplication, "", "en").await;
    }
}

/// Bridge a client byte stream and an SSH channel until either side ends.
/// Mirrors the single-task, `tokio::select!`-driven relay used by every
/// `russh`-based forwarder in this ecosystem: one task owns the channel, so
/// no locking is needed around it.
pub async fn relay_channel<C>(mut client: C, mut channel: Channel<client::Msg>)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut client_closed = false;
    let mut channel_closed = false;

    loop {
        if client_closed && channel_closed {
            break;
        }

        tokio::select! {
            result = client.read(&mut buf), if !client_closed => {
                match result {
                    Ok(0) | Err(_) => {
                        client_closed = true;
                        let _ = channel.eof().await;
                    }
                    Ok(n) => {
                        if channel.data(&buf[..n]).await.is_err() {
                            client_closed = true;
                        }
                    }
                }
            }

            msg = channel.wait(), if !channel_closed => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if client.write_all(&data).await.is_err() {
                            channel_closed = true;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        channel_closed = true;
                    }
                    Some(_) => {}
                }
            }
        }
    }
}
