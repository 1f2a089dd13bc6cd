//! Upstream connector: the four ways this gateway can reach a target
//! host:port through a configured `Server` — a plain TCP dial, an HTTP
//! CONNECT tunnel, a SOCKS5 CONNECT tunnel, or an SSH direct-tcpip channel.

pub mod server;
pub mod ssh;
pub mod tunnel;

pub use server::{ConnectError, ProtocolKind, Server, ServerCapabilities};
pub use tunnel::{relay, relay_with_preamble, request_response, Tunnel};
