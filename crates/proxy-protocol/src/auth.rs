//! HTTP Basic / SOCKS5 username-password credential pair shared by
//! listeners (verifying a client) and upstream connectors (authenticating
//! to an upstream).

use base64::Engine;

/// A username/password pair. Cheap to clone; treated as immutable once
/// attached to a `Server` or `Listener`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

impl ProxyAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }

    /// `"user:pass"`.
    pub fn to_plain_string(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }

    /// Standard base64 of [`Self::to_plain_string`], the value that goes
    /// after `Basic ` in a `Proxy-Authorization` header.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_plain_string())
    }

    /// Verify a raw header value such as `"Basic a2hhbmg6a2hhbmg="`.
    ///
    /// Matches the upstream project byte for byte: the whole value is
    /// lowercased before the `basic` scheme token and leading spaces are
    /// stripped, and the remainder is compared against the (not lowercased)
    /// base64 digest. Credentials containing uppercase letters therefore
    /// only verify if the caller also lowercases them — this is the
    /// project's long-standing behavior, not an oversight to fix here.
    pub fn verify_basic(&self, header_value: &str) -> bool {
        let lowered = header_value.to_lowercase();
        let stripped = lowered.strip_prefix("basic").unwrap_or(&lowered);
        stripped.trim_start_matches(' ') == self.to_base64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_base64_matches_known_value() {
        let auth = ProxyAuth::new("khanh", "khanh");
        assert_eq!(auth.to_base64(), "a2hhbmg6a2hhbmg=");
    }

    #[test]
    fn verify_basic_accepts_canonical_header() {
        let auth = ProxyAuth::new("khanh", "khanh");
        assert!(auth.verify_basic("Basic a2hhbmg6a2hhbmg="));
    }

    #[test]
    fn verify_basic_tolerates_extra_leading_spaces() {
        let auth = ProxyAuth::new("khanh", "khanh");
        assert!(auth.verify_basic("basic    a2hhbmg6a2hhbmg="));
    }

    #[test]
    fn verify_basic_rejects_wrong_credentials() {
        let auth = ProxyAuth::new("khanh", "khanh");
        assert!(!auth.verify_basic("Basic d3Jvbmc6d3Jvbmc="));
    }
}
