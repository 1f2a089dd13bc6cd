//! The stream a connector hands back: either a plain TCP socket (Direct,
//! HTTP, SOCKS5) or an SSH channel (SSH). [`relay`] picks the right way to
//! splice it against the client.

use russh::client;
use russh::ChannelMsg;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::ssh;

/// A connected upstream, ready to be spliced against the client stream.
pub enum Tunnel {
    Stream(TcpStream),
    Ssh(russh::Channel<client::Msg>),
}

/// Splice `client` against whatever `tunnel` turned out to be. TCP-backed
/// tunnels go through the generic byte-stream splicer; SSH channels go
/// through the SSH-specific relay loop, since a `russh::Channel` doesn't
/// implement `AsyncRead`/`AsyncWrite`.
pub async fn relay<C>(client: C, tunnel: Tunnel)
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match tunnel {
        Tunnel::Stream(upstream) => proxy_protocol::splice(client, upstream).await,
        Tunnel::Ssh(channel) => ssh::relay_channel(client, channel).await,
    }
}

/// Write `preamble` into the tunnel, then splice it against `client` as
/// [`relay`] would. Used by the HTTP listener path, which has already
/// decided what the rewritten request line looks like before the tunnel
/// becomes a raw byte pipe.
pub async fn relay_with_preamble<C>(client: C, mut tunnel: Tunnel, preamble: &[u8]) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match &mut tunnel {
        Tunnel::Stream(stream) => stream.write_all(preamble).await?,
        Tunnel::Ssh(channel) => channel.data(preamble).await.map_err(|e| std::io::Error::other(e.to_string()))?,
    }
    relay(client, tunnel).await;
    Ok(())
}

/// Send one request and collect everything the upstream writes back until
/// it closes the connection. Used only by the health checker's one-shot
/// probe against `api.ipify.org` — never by the listener's live traffic
/// path, which always goes through [`relay`] instead.
pub async fn request_response(tunnel: Tunnel, request: &[u8]) -> std::io::Result<Vec<u8>> {
    match tunnel {
        Tunnel::Stream(mut stream) => {
            stream.write_all(request).await?;
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await?;
            Ok(buf)
        }
        Tunnel::Ssh(mut channel) => {
            channel
                .data(request)
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            let _ = channel.eof().await;

            let mut buf = Vec::new();
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => buf.extend_from_slice(&data),
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
            Ok(buf)
        }
    }
}
