//! Request classification: the first bytes of a client connection decide
//! whether it is a tunnel or a plain request, and where it goes.

use memchr::memmem;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProxyError;
use crate::response::headers;

pub const MAX_REQUEST_HEAD: usize = 64 * 1024;
const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedRequest {
    pub method: String,
    pub is_https: bool,
    pub host: String,
    pub port: u16,
    /// Cache key: the absolute URL without its scheme, or `host:port` for tunnels.
    pub raw_url: String,
}

impl ClassifiedRequest {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Only GET responses are replayed from the cache, since the key is the URL alone.
    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }
}

/// Parses the request line and `Host` header of a client request head.
pub fn classify(buf: &[u8]) -> Result<ClassifiedRequest, ProxyError> {
    let text = String::from_utf8_lossy(buf);
    let request_line = text.lines().next().ok_or(ProxyError::Parse("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(ProxyError::Parse("missing method"))?;
    let target = parts.next().ok_or(ProxyError::Parse("missing request target"))?;

    if method == "CONNECT" {
        let (host, port) = split_host_port(target, 443)?;
        return Ok(ClassifiedRequest {
            method: method.to_string(),
            is_https: true,
            host: host.to_string(),
            port,
            raw_url: format!("{}:{}", host, port),
        });
    }

    let host_header = headers(buf)
        .find(|h| h.is("Host"))
        .ok_or(ProxyError::Parse("missing Host header"))?;
    let host_value = std::str::from_utf8(host_header.value)
        .map_err(|_| ProxyError::Parse("non-ascii Host header"))?
        .trim();
    let (host, port) = split_host_port(host_value, 80)?;

    let raw_url = match target.strip_prefix("http://") {
        Some(rest) => rest.to_string(),
        None if target.starts_with('/') => format!("{}{}", host_value, target),
        None => target.to_string(),
    };

    Ok(ClassifiedRequest {
        method: method.to_string(),
        is_https: false,
        host: host.to_string(),
        port,
        raw_url,
    })
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(&str, u16), ProxyError> {
    if authority.is_empty() {
        return Err(ProxyError::Parse("empty host"));
    }

    // Bracketed IPv6 literal, optionally followed by a port.
    if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']').ok_or(ProxyError::Parse("unterminated IPv6 literal"))?;
        let host = &rest[..close];
        let port = match rest[close + 1..].strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| ProxyError::Parse("invalid port"))?,
            None => default_port,
        };
        return Ok((host, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().map_err(|_| ProxyError::Parse("invalid port"))?;
            Ok((host, port))
        }
        Some(_) => Err(ProxyError::Parse("empty host")),
        None => Ok((authority, default_port)),
    }
}

/// WebSocket handshakes bypass the cache and go straight to splicing.
pub fn is_websocket_upgrade(buf: &[u8]) -> bool {
    headers(buf).any(|h| {
        (h.is("Upgrade") && h.value_contains("websocket"))
            || (h.is("Connection") && h.value_contains("upgrade"))
    })
}

/// Reads from `reader` until the request head is complete, the peer closes,
/// or `limit` bytes have arrived. Anything read past the head stays in the
/// returned buffer so it can be forwarded as is.
pub async fn read_request_head<R>(reader: &mut R, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        // Only rescan the tail that could complete a new terminator.
        let scan_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);
        if memmem::find(&buf[scan_from..], b"\r\n\r\n").is_some() || buf.len() >= limit {
            break;
        }
    }

    Ok(buf)
}
