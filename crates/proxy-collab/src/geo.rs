//! Public-IP to country-code resolution, backed by an embedded MaxMind
//! `mmdb` database. Used only to tag a [`ManagedServer`] with a two-letter
//! ISO-3166-1 code after a health check reports a public IP.

use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

use crate::CollabError;

/// Resolves a public IP string to an ISO-3166-1 alpha-2 country code.
pub trait GeoLookup: Send + Sync {
    /// Returns `None` if the address can't be parsed or has no entry in the
    /// database — never an error, since geo-tagging is best-effort.
    fn country_for_ip(&self, ip: &str) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct CountryRecord<'a> {
    #[serde(borrow)]
    country: Option<Country<'a>>,
}

#[derive(Debug, Deserialize)]
struct Country<'a> {
    #[serde(borrow, rename = "iso_code")]
    iso_code: Option<&'a str>,
}

/// `GeoLookup` backed by a read-only MaxMind GeoLite2-Country (or
/// GeoIP2-Country) database opened once at startup and mmapped for the
/// life of the process.
pub struct MaxmindGeoLookup {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxmindGeoLookup {
    /// Opens the database at `path`. This is the only collaborator
    /// operation that can fail outright — a missing database means
    /// geo-tagging should be disabled for the whole run, not silently
    /// skipped per lookup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CollabError> {
        let path_str = path.as_ref().display().to_string();
        let reader = maxminddb::Reader::open_readfile(path.as_ref()).map_err(|source| {
            CollabError::GeoDatabase { path: path_str, source }
        })?;
        Ok(Self { reader })
    }
}

impl GeoLookup for MaxmindGeoLookup {
    fn country_for_ip(&self, ip: &str) -> Option<String> {
        let addr: IpAddr = ip.parse().ok()?;
        let record: CountryRecord = self.reader.lookup(addr).ok()??;
        let iso = record.country?.iso_code?;
        Some(iso.to_string())
    }
}

/// A `GeoLookup` that never resolves anything, used when no database path
/// is configured so the fleet manager can still run without geo-tagging.
#[derive(Debug, Default)]
pub struct NoGeoLookup;

impl GeoLookup for NoGeoLookup {
    fn country_for_ip(&self, _ip: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_geo_lookup_always_none() {
        let lookup = NoGeoLookup;
        assert_eq!(lookup.country_for_ip("8.8.8.8"), None);
    }
}
