//! Thin collaborators the fleet manager and the listener consult for
//! observability only: which local process owns an inbound socket, and
//! which country a server's reported public IP geolocates to. Neither
//! failure here affects whether a connection is allowed to proceed.

pub mod geo;
pub mod process;

pub use geo::{GeoLookup, MaxmindGeoLookup, NoGeoLookup};
pub use process::{ProcessLookup, SystemProcessLookup};

/// Failures surfaced by the collaborators. Callers generally log these at
/// debug level and fall back to "unknown" rather than failing the caller's
/// own operation.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("failed to open MaxMind database at {path}: {source}")]
    GeoDatabase {
        path: String,
        #[source]
        source: maxminddb::MaxMindDbError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
