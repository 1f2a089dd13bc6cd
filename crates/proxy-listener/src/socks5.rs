//! Server-side SOCKS5 state machine: Greet → (Auth) → Cmd → Tunnel.

use std::net::Ipv4Addr;
use std::sync::Arc;

use proxy_fleet::{FleetManager, ManagedListener};
use proxy_protocol::socks5::{self as codec};
use proxy_protocol::{AuthMethod, AuthStatus, CommandReply, ReplyCode, SocksCommand, Socks5Address};
use proxy_upstream::Tunnel;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::ListenerError;

pub async fn handle<S>(mut client: S, listener: &Arc<ManagedListener>, fleet: &FleetManager) -> Result<(), ListenerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let methods = codec::read_greeting(&mut client).await?;
    let required = if listener.auth.is_some() { AuthMethod::UserPass } else { AuthMethod::NoAuth };

    if !methods.contains(&required) {
        codec::write_method_select(&mut client, AuthMethod::NoAcceptableMethod).await?;
        return Ok(());
    }
    codec::write_method_select(&mut client, required).await?;

    if required == AuthMethod::UserPass {
        let creds = codec::read_user_pass(&mut client).await?;
        let auth = listener.auth.as_ref().expect("UserPass only required when a listener has credentials");
        if creds.username != auth.username || creds.password != auth.password {
            codec::write_user_pass_reply(&mut client, AuthStatus::Failure).await?;
            return Ok(());
        }
        codec::write_user_pass_reply(&mut client, AuthStatus::Success).await?;
    }

    let request = codec::read_request(&mut client).await?;
    if request.command != SocksCommand::Connect {
        codec::write_reply(&mut client, &CommandReply::failure(ReplyCode::CommandNotSupported)).await?;
        return Ok(());
    }

    let target = format!("{}:{}", request.address.to_host_string(), request.port);

    let managed = match fleet.get_server(&listener.filter).await {
        Ok(managed) => managed,
        Err(_) => {
            codec::write_reply(&mut client, &CommandReply::failure(ReplyCode::GeneralFailure)).await?;
            return Ok(());
        }
    };

    if !managed.server.is_prepared().await && managed.server.prepare().await.is_err() {
        codec::write_reply(&mut client, &CommandReply::failure(ReplyCode::GeneralFailure)).await?;
        return Ok(());
    }

    let tunnel = match managed.server.connect(&target).await {
        Ok(tunnel) => tunnel,
        Err(_) => {
            codec::write_reply(&mut client, &CommandReply::failure(ReplyCode::GeneralFailure)).await?;
            return Ok(());
        }
    };

    let (bind_addr, bind_port) = bind_address_for(&tunnel);
    codec::write_reply(&mut client, &CommandReply { code: ReplyCode::Succeeded, bind_addr, bind_port }).await?;

    proxy_upstream::relay(client, tunnel).await;
    Ok(())
}

/// The local address the gateway's own socket to the upstream is bound to.
/// SSH channels have no socket of their own to report, so they fall back
/// to the conventional `0.0.0.0:0`.
fn bind_address_for(tunnel: &Tunnel) -> (Socks5Address, u16) {
    match tunnel {
        Tunnel::Stream(stream) => match stream.local_addr() {
            Ok(addr) => (Socks5Address::from_host(&addr.ip().to_string()), addr.port()),
            Err(_) => (Socks5Address::V4(Ipv4Addr::UNSPECIFIED), 0),
        },
        Tunnel::Ssh(_) => (Socks5Address::V4(Ipv4Addr::UNSPECIFIED), 0),
    }
}
