//! Request/response shapes for the control surface, serialized the way a
//! front-end (local shell, desktop UI) would consume them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSpec {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerSpec {
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub server_ids: Vec<String>,
    #[serde(default)]
    pub ignore_all: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateResponse {
    pub local_ip: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilitySnapshot {
    pub http: bool,
    pub socks5: bool,
    pub ssh: bool,
    pub direct: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub capabilities: CapabilitySnapshot,
    pub public_ip: String,
    pub latency_ms: u128,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerSnapshot {
    pub requested_port: u16,
    pub bound_port: Option<u16>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub serving: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub servers: Vec<ServerSnapshot>,
    pub listeners: Vec<ListenerSnapshot>,
}

/// Parameters for [`crate::ControlSurface::import_proxy_file`], mirroring
/// the positional-field CSV-like format described for the control surface.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportOptions {
    pub separator: char,
    pub skip_cols: usize,
    pub default_port: u16,
    pub skip_header: bool,
}
