//! Just enough HTTP/1.x for a forward proxy front door: request heads,
//! `key=value` auth parameter lists and canned error pages.

use std::collections::HashMap;

/// Upper bound on a request head; larger heads are rejected.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

/// A parsed request line plus headers. The body, if any, stays on the wire.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub uri: String,
    /// Minor version, `1` for HTTP/1.1.
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn proxy_authorization(&self) -> Option<&str> {
        self.header("Proxy-Authorization").filter(|v| !v.is_empty())
    }

    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding").is_some()
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Head to send upstream for an absolute-form request: origin-form
    /// target, proxy headers stripped, one request per connection.
    pub fn forward_head(&self, path: &str) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.{}\r\n", self.method, path, self.version);
        for (name, value) in &self.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("Connection: close\r\n\r\n");
        out.into_bytes()
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    ["Proxy-Authorization", "Proxy-Connection", "Connection", "Keep-Alive"]
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Try to parse a request head from the start of `buf`.
///
/// Returns `Ok(None)` while the head is incomplete, otherwise the request
/// and the number of bytes the head occupied.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(Request, usize)>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let request = Request {
        method: req.method.unwrap_or_default().to_string(),
        uri: req.path.unwrap_or_default().to_string(),
        version: req.version.unwrap_or(1),
        headers: req
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect(),
    };
    Ok(Some((request, head_len)))
}

/// Split `host[:port]` (IPv6 literals in brackets) with a fallback port.
pub fn parse_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port.parse().ok()?))
        }
        Some(_) => None,
        None => Some((authority.to_string(), default_port)),
    }
}

/// Split an absolute-form `http://host[:port]/path` target.
pub fn split_absolute_uri(uri: &str) -> Option<(String, u16, String)> {
    let scheme_end = uri.find("://")?;
    if !uri[..scheme_end].eq_ignore_ascii_case("http") {
        return None;
    }
    let rest = &uri[scheme_end + 3..];
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    // Drop userinfo, never forwarded.
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
    let (host, port) = parse_host_port(authority, 80)?;
    Some((host, port, path.to_string()))
}

/// Parse a comma separated `key=value` / `key="value"` list as found in
/// Digest credentials. Any element without `=` invalidates the whole list,
/// which is then returned empty.
pub fn parse_key_value_list(s: &str) -> HashMap<String, String> {
    let mut res = HashMap::new();
    if s.trim().is_empty() {
        return res;
    }
    for element in s.split(',') {
        let Some((key, val)) = element.trim().split_once('=') else {
            return HashMap::new();
        };
        let val = match val.strip_prefix('"') {
            Some(inner) => inner.strip_suffix('"').unwrap_or(inner),
            None => val,
        };
        res.insert(key.trim().to_string(), val.to_string());
    }
    res
}

/// Complete HTML error response. The connection is closed afterwards.
/// `detail` may carry client input and is escaped.
pub fn error_page(code: u16, reason: &str, msg: &str, detail: &str) -> String {
    let detail = escape_html(detail);
    let body = format!(
        "<!DOCTYPE html>\n<html>\n\t<head> <title>{code} {reason}</title> </head>\n\t<body>\n\t\t<h1>{msg}</h1>\n\t\t{detail}\n\t</body>\n</html>\n"
    );
    format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: text/html\r\nCache-Control: no-cache\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
