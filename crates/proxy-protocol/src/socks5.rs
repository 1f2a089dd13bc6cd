//! SOCKS5 wire format (RFC 1928) plus the username/password sub-negotiation
//! (RFC 1929). Every message is a small fixed-or-length-prefixed frame; the
//! functions here read/write exactly one frame and never buffer ahead.

use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS protocol version byte used throughout.
const VERSION: u8 = 0x05;

/// RFC 1929 sub-negotiation version byte.
const AUTH_VERSION: u8 = 0x01;

/// Authentication method octets exchanged during the greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth,
    UserPass,
    NoAcceptableMethod,
}

impl AuthMethod {
    fn to_byte(self) -> u8 {
        match self {
            AuthMethod::NoAuth => 0x00,
            AuthMethod::UserPass => 0x02,
            AuthMethod::NoAcceptableMethod => 0xFF,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(AuthMethod::NoAuth),
            0x02 => Some(AuthMethod::UserPass),
            _ => None,
        }
    }
}

/// Address type octet (ATYP) preceding the address in a command or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    V4,
    Domain,
    V6,
}

impl AddrType {
    fn to_byte(self) -> u8 {
        match self {
            AddrType::V4 => 0x01,
            AddrType::Domain => 0x03,
            AddrType::V6 => 0x04,
        }
    }

    fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x01 => Ok(AddrType::V4),
            0x03 => Ok(AddrType::Domain),
            0x04 => Ok(AddrType::V6),
            other => Err(ProtocolError::UnsupportedAddrType(other)),
        }
    }
}

/// A decoded SOCKS5 address (the ATYP-tagged payload of a command or reply).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Address {
    V4(Ipv4Addr),
    Domain(String),
    V6(Ipv6Addr),
}

impl Socks5Address {
    fn addr_type(&self) -> AddrType {
        match self {
            Socks5Address::V4(_) => AddrType::V4,
            Socks5Address::Domain(_) => AddrType::Domain,
            Socks5Address::V6(_) => AddrType::V6,
        }
    }

    /// Build the address variant that would be used to dial `host`: an IPv4
    /// or IPv6 literal maps to the matching fixed-width type, anything else
    /// is sent as a domain name.
    pub fn from_host(host: &str) -> Self {
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            Socks5Address::V4(v4)
        } else if let Ok(v6) = host.parse::<Ipv6Addr>() {
            Socks5Address::V6(v6)
        } else {
            Socks5Address::Domain(host.to_string())
        }
    }

    /// Render as a `host:port`-style string for logging and for dialing.
    pub fn to_host_string(&self) -> String {
        match self {
            Socks5Address::V4(ip) => ip.to_string(),
            Socks5Address::Domain(d) => d.clone(),
            Socks5Address::V6(ip) => format!("[{ip}]"),
        }
    }

    async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), ProtocolError> {
        w.write_u8(self.addr_type().to_byte()).await?;
        match self {
            Socks5Address::V4(ip) => w.write_all(&ip.octets()).await?,
            Socks5Address::V6(ip) => w.write_all(&ip.octets()).await?,
            Socks5Address::Domain(d) => {
                if d.len() > u8::MAX as usize {
                    return Err(ProtocolError::MalformedFrame("domain name too long"));
                }
                w.write_u8(d.len() as u8).await?;
                w.write_all(d.as_bytes()).await?;
            }
        }
        Ok(())
    }

    async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProtocolError> {
        let atyp = AddrType::from_byte(r.read_u8().await?)?;
        Ok(match atyp {
            AddrType::V4 => {
                let mut buf = [0u8; 4];
                r.read_exact(&mut buf).await?;
                Socks5Address::V4(Ipv4Addr::from(buf))
            }
            AddrType::V6 => {
                let mut buf = [0u8; 16];
                r.read_exact(&mut buf).await?;
                Socks5Address::V6(Ipv6Addr::from(buf))
            }
            AddrType::Domain => {
                let len = r.read_u8().await? as usize;
                let mut buf = vec![0u8; len];
                r.read_exact(&mut buf).await?;
                Socks5Address::Domain(String::from_utf8_lossy(&buf).into_owned())
            }
        })
    }
}

/// The single command this codec honors end to end (BIND/UDP ASSOCIATE
/// decode but are rejected by callers before a connector is ever consulted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    Connect,
    Bind,
    UdpAssociate,
}

impl SocksCommand {
    fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x01 => Ok(SocksCommand::Connect),
            0x02 => Ok(SocksCommand::Bind),
            0x03 => Ok(SocksCommand::UdpAssociate),
            other => Err(ProtocolError::UnsupportedCommand(other)),
        }
    }
}

/// Reply status octet (REP) sent back to the client after a CONNECT attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
}

impl ReplyCode {
    fn to_byte(self) -> u8 {
        match self {
            ReplyCode::Succeeded => 0x00,
            ReplyCode::GeneralFailure => 0x01,
            ReplyCode::ConnectionNotAllowed => 0x02,
            ReplyCode::NetworkUnreachable => 0x03,
            ReplyCode::HostUnreachable => 0x04,
            ReplyCode::ConnectionRefused => 0x05,
            ReplyCode::TtlExpired => 0x06,
            ReplyCode::CommandNotSupported => 0x07,
            ReplyCode::AddressTypeNotSupported => 0x08,
        }
    }

    fn from_byte(b: u8) -> Self {
        match b {
            0x00 => ReplyCode::Succeeded,
            0x02 => ReplyCode::ConnectionNotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            _ => ReplyCode::GeneralFailure,
        }
    }
}

/// A parsed CONNECT/BIND/UDP-ASSOCIATE request from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub command: SocksCommand,
    pub address: Socks5Address,
    pub port: u16,
}

/// The reply frame sent back after acting on a [`SocksRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub code: ReplyCode,
    pub bind_addr: Socks5Address,
    pub bind_port: u16,
}

impl CommandReply {
    /// A failure reply with the conventional `0.0.0.0:0` bind address.
    pub fn failure(code: ReplyCode) -> Self {
        Self {
            code,
            bind_addr: Socks5Address::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 0,
        }
    }
}

/// A decoded username/password sub-negotiation request (RFC 1929).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPassRequest {
    pub username: String,
    pub password: String,
}

/// Outcome of a username/password sub-negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Success,
    Failure,
}

/// Read the client greeting (`VER | NMETHODS | METHODS`) and return the
/// methods it advertised, ignoring any byte this codec does not recognize.
pub async fn read_greeting<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Vec<AuthMethod>, ProtocolError> {
    let ver = r.read_u8().await?;
    if ver != VERSION {
        return Err(ProtocolError::MalformedFrame("unexpected SOCKS version"));
    }
    let n = r.read_u8().await? as usize;
    let mut raw = vec![0u8; n];
    r.read_exact(&mut raw).await?;
    Ok(raw.into_iter().filter_map(AuthMethod::from_byte).collect())
}

/// Write the server's method-select reply (`VER | METHOD`).
pub async fn write_method_select<W: AsyncWrite + Unpin>(
    w: &mut W,
    method: AuthMethod,
) -> Result<(), ProtocolError> {
    w.write_all(&[VERSION, method.to_byte()]).await?;
    Ok(())
}

/// Read a username/password sub-negotiation request.
pub async fn read_user_pass<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<UserPassRequest, ProtocolError> {
    let ver = r.read_u8().await?;
    if ver != AUTH_VERSION {
        return Err(ProtocolError::MalformedFrame("unexpected auth sub-negotiation version"));
    }
    let ulen = r.read_u8().await? as usize;
    let mut uname = vec![0u8; ulen];
    r.read_exact(&mut uname).await?;
    let plen = r.read_u8().await? as usize;
    let mut passwd = vec![0u8; plen];
    r.read_exact(&mut passwd).await?;
    Ok(UserPassRequest {
        username: String::from_utf8_lossy(&uname).into_owned(),
        password: String::from_utf8_lossy(&passwd).into_owned(),
    })
}

/// Write a username/password sub-negotiation request as a client.
pub async fn write_user_pass<W: AsyncWrite + Unpin>(
    w: &mut W,
    username: &str,
    password: &str,
) -> Result<(), ProtocolError> {
    if username.len() > u8::MAX as usize || password.len() > u8::MAX as usize {
        return Err(ProtocolError::MalformedFrame("credential too long to frame"));
    }
    w.write_u8(AUTH_VERSION).await?;
    w.write_u8(username.len() as u8).await?;
    w.write_all(username.as_bytes()).await?;
    w.write_u8(password.len() as u8).await?;
    w.write_all(password.as_bytes()).await?;
    Ok(())
}

/// Write the sub-negotiation reply (`VER | STATUS`), `0x00` meaning success.
pub async fn write_user_pass_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: AuthStatus,
) -> Result<(), ProtocolError> {
    let byte = match status {
        AuthStatus::Success => 0x00,
        AuthStatus::Failure => 0xFF,
    };
    w.write_all(&[AUTH_VERSION, byte]).await?;
    Ok(())
}

/// Read the sub-negotiation reply as a client.
pub async fn read_user_pass_reply<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<AuthStatus, ProtocolError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).await?;
    Ok(if buf[1] == 0x00 { AuthStatus::Success } else { AuthStatus::Failure })
}

/// Read a request frame (`VER | CMD | RSV | ATYP | ADDR | PORT`).
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<SocksRequest, ProtocolError> {
    let mut header = [0u8; 3];
    r.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(ProtocolError::MalformedFrame("unexpected SOCKS version"));
    }
    let command = SocksCommand::from_byte(header[1])?;
    let address = Socks5Address::read(r).await?;
    let port = r.read_u16().await?;
    Ok(SocksRequest { command, address, port })
}

/// Write a request frame as a client issuing a CONNECT.
pub async fn write_connect_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    address: &Socks5Address,
    port: u16,
) -> Result<(), ProtocolError> {
    w.write_all(&[VERSION, 0x01, 0x00]).await?;
    address.write(w).await?;
    w.write_u16(port).await?;
    Ok(())
}

/// Write a reply frame (`VER | REP | RSV | ATYP | BND.ADDR | BND.PORT`).
pub async fn write_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    reply: &CommandReply,
) -> Result<(), ProtocolError> {
    w.write_all(&[VERSION, reply.code.to_byte(), 0x00]).await?;
    reply.bind_addr.write(w).await?;
    w.write_u16(reply.bind_port).await?;
    Ok(())
}

/// Read a reply frame as a client.
pub async fn read_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<CommandReply, ProtocolError> {
    let mut header = [0u8; 3];
    r.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(ProtocolError::MalformedFrame("unexpected SOCKS version"));
    }
    let code = ReplyCode::from_byte(header[1]);
    let bind_addr = Socks5Address::read(r).await?;
    let bind_port = r.read_u16().await?;
    Ok(CommandReply { code, bind_addr, bind_port })
}

/// Codec-level failures. Anything past this boundary is either the remote
/// end disconnecting mid-frame (`Io`) or sending a byte this implementation
/// does not recognize.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed SOCKS5 frame: {0}")]
    MalformedFrame(&'static str),

    #[error("unsupported SOCKS5 command byte: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported SOCKS5 address type: {0:#04x}")]
    UnsupportedAddrType(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn address_round_trips_v4() {
        let addr = Socks5Address::V4(Ipv4Addr::new(10, 0, 0, 1));
        let mut buf = Vec::new();
        addr.write(&mut buf).await.unwrap();
        let mut cur = Cursor::new(buf);
        let decoded = Socks5Address::read(&mut cur).await.unwrap();
        assert_eq!(addr, decoded);
    }

    #[tokio::test]
    async fn address_round_trips_domain() {
        let addr = Socks5Address::Domain("example.com".to_string());
        let mut buf = Vec::new();
        addr.write(&mut buf).await.unwrap();
        let mut cur = Cursor::new(buf);
        let decoded = Socks5Address::read(&mut cur).await.unwrap();
        assert_eq!(addr, decoded);
    }

    #[tokio::test]
    async fn address_round_trips_v6() {
        let addr = Socks5Address::V6(Ipv6Addr::LOCALHOST);
        let mut buf = Vec::new();
        addr.write(&mut buf).await.unwrap();
        let mut cur = Cursor::new(buf);
        let decoded = Socks5Address::read(&mut cur).await.unwrap();
        assert_eq!(addr, decoded);
    }

    #[test]
    fn from_host_picks_the_right_variant() {
        assert_eq!(Socks5Address::from_host("127.0.0.1"), Socks5Address::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(Socks5Address::from_host("::1"), Socks5Address::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(
            Socks5Address::from_host("example.com"),
            Socks5Address::Domain("example.com".to_string())
        );
    }

    #[tokio::test]
    async fn greeting_round_trips() {
        let mut buf = Vec::new();
        buf.push(VERSION);
        buf.push(2);
        buf.push(0x00);
        buf.push(0x02);
        let mut cur = Cursor::new(buf);
        let methods = read_greeting(&mut cur).await.unwrap();
        assert_eq!(methods, vec![AuthMethod::NoAuth, AuthMethod::UserPass]);
    }

    #[tokio::test]
    async fn user_pass_round_trips() {
        let mut buf = Vec::new();
        write_user_pass(&mut buf, "khanh", "khanh").await.unwrap();
        let mut cur = Cursor::new(buf);
        let req = read_user_pass(&mut cur).await.unwrap();
        assert_eq!(req.username, "khanh");
        assert_eq!(req.password, "khanh");
    }

    #[tokio::test]
    async fn request_round_trips() {
        let mut buf = Vec::new();
        let addr = Socks5Address::from_host("example.com");
        write_connect_request(&mut buf, &addr, 443).await.unwrap();
        let mut cur = Cursor::new(buf);
        let req = read_request(&mut cur).await.unwrap();
        assert_eq!(req.command, SocksCommand::Connect);
        assert_eq!(req.address, addr);
        assert_eq!(req.port, 443);
    }

    #[tokio::test]
    async fn reply_round_trips() {
        let mut buf = Vec::new();
        let reply = CommandReply {
            code: ReplyCode::Succeeded,
            bind_addr: Socks5Address::V4(Ipv4Addr::new(127, 0, 0, 1)),
            bind_port: 9001,
        };
        write_reply(&mut buf, &reply).await.unwrap();
        let mut cur = Cursor::new(buf);
        let decoded = read_reply(&mut cur).await.unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn unsupported_addr_type_is_rejected() {
        assert!(AddrType::from_byte(0x02).is_err());
    }
}
