//! HTTP/1.1 proxy path: absolute-URI forwarding and CONNECT tunneling,
//! per RFC 7230 §5.3.2.

use std::sync::Arc;

use proxy_fleet::{FleetManager, ManagedListener};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::ListenerError;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

pub async fn handle<S>(mut client: S, listener: &Arc<ManagedListener>, fleet: &FleetManager) -> Result<(), ListenerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let head = read_head(&mut client).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let (method, request_target, version, headers) = {
        let mut req = httparse::Request::new(&mut header_storage);
        let status = req.parse(&head).map_err(|_| ListenerError::ClientProtocol("malformed HTTP request"))?;
        if status.is_partial() {
            return Err(ListenerError::ClientProtocol("incomplete HTTP request head"));
        }
        let method = req.method.ok_or(ListenerError::ClientProtocol("missing method"))?.to_string();
        let request_target = req.path.ok_or(ListenerError::ClientProtocol("missing request target"))?.to_string();
        let version = req.version.unwrap_or(1);
        let headers: Vec<(String, String)> = req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
            .collect();
        (method, request_target, version, headers)
    };

    let is_connect = method.eq_ignore_ascii_case("CONNECT");

    let target = if is_connect {
        request_target.clone()
    } else {
        match absolute_target(&request_target) {
            Some(target) => target,
            None => {
                write_status(&mut client, 400, "Bad Request", &[]).await?;
                return Ok(());
            }
        }
    };

    if let Some(auth) = &listener.auth {
        let proxy_auth = header_value(&headers, "proxy-authorization");
        let verified = proxy_auth.map(|v| auth.verify_basic(v)).unwrap_or(false);
        if !verified {
            write_status(&mut client, 407, "Proxy Authentication Required", &[("Proxy-Authenticate", "Basic realm=\"GoProxy\"")]).await?;
            return Ok(());
        }
    }

    let managed = match fleet.get_server(&listener.filter).await {
        Ok(managed) => managed,
        Err(_) => {
            write_status(&mut client, 502, "Bad Gateway", &[]).await?;
            return Ok(());
        }
    };

    if !managed.server.is_prepared().await && managed.server.prepare().await.is_err() {
        write_status(&mut client, 502, "Bad Gateway", &[]).await?;
        return Ok(());
    }

    let tunnel = match managed.server.connect(&target).await {
        Ok(tunnel) => tunnel,
        Err(_) => {
            write_status(&mut client, 502, "Bad Gateway", &[]).await?;
            return Ok(());
        }
    };

    if is_connect {
        client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
        proxy_upstream::relay(client, tunnel).await;
    } else {
        let rewritten = rewrite_request(&method, &request_target, version, &headers);
        proxy_upstream::relay_with_preamble(client, tunnel, rewritten.as_bytes()).await?;
    }

    Ok(())
}

/// Read raw bytes up to and including the blank line terminating the
/// header block, leaving any body bytes unread in the client stream so
/// the splicer forwards them untouched.
async fn read_head<S: AsyncRead + Unpin>(client: &mut S) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        client.read_exact(&mut byte).await?;
        buf.push(byte[0]);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            return Ok(buf);
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "request head too large"));
        }
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
}

/// Parse a non-CONNECT request-target as an absolute URI and return
/// `host:port`, defaulting to port 80 when the URI omits one.
fn absolute_target(request_target: &str) -> Option<String> {
    let url = Url::parse(request_target).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default().unwrap_or(80);
    Some(format!("{host}:{port}"))
}

/// Rewrite the request line to send only the path (+query/fragment) the
/// upstream expects, carrying every header but `Proxy-Authorization`.
fn rewrite_request(method: &str, request_target: &str, version: u8, headers: &[(String, String)]) -> String {
    let path = Url::parse(request_target)
        .ok()
        .map(|url| {
            let mut rendered = url.path().to_string();
            if let Some(query) = url.query() {
                rendered.push('?');
                rendered.push_str(query);
            }
            if let Some(fragment) = url.fragment() {
                rendered.push('#');
                rendered.push_str(fragment);
            }
            rendered
        })
        .unwrap_or_else(|| request_target.to_string());

    let version_str = if version == 0 { "HTTP/1.0" } else { "HTTP/1.1" };
    let mut request = format!("{method} {path} {version_str}\r\n");
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("proxy-authorization") {
            continue;
        }
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

async fn write_status<S: AsyncWrite + Unpin>(client: &mut S, status: u16, reason: &str, extra_headers: &[(&str, &str)]) -> std::io::Result<()> {
    let mut response = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in extra_headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("Content-Length: 0\r\n\r\n");
    client.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_target_defaults_port_80() {
        assert_eq!(absolute_target("http://example.com/path").as_deref(), Some("example.com:80"));
    }

    #[test]
    fn absolute_target_keeps_explicit_port() {
        assert_eq!(absolute_target("http://example.com:8080/path").as_deref(), Some("example.com:8080"));
    }

    #[test]
    fn absolute_target_rejects_relative_uri() {
        assert_eq!(absolute_target("/path"), None);
    }

    #[test]
    fn rewrite_strips_proxy_authorization_and_keeps_path() {
        let headers = vec![
            ("Host".to_string(), "example.com".to_string()),
            ("Proxy-Authorization".to_string(), "Basic xyz".to_string()),
        ];
        let request = rewrite_request("GET", "http://example.com/a/b?x=1", 1, &headers);
        assert!(request.starts_with("GET /a/b?x=1 HTTP/1.1\r\n"));
        assert!(!request.contains("Proxy-Authorization"));
        assert!(request.contains("Host: example.com"));
    }
}
