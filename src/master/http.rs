//! Minimal HTTP/1.1 framing for the routing core
//!
//! Whole requests and responses are parsed off a connection so each one can
//! be replayed onto a downstream stream and its answer proxied back.
//! Chunked bodies are decoded and re-serialized with a Content-Length;
//! everything else passes through with headers intact.

use super::MasterError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

const MAX_HEADERS: usize = 128;
const MAX_LINE: usize = 16 * 1024;
const MAX_BODY: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    /// Request target exactly as received (origin or absolute form).
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Host taken from an absolute-form target, else the Host header.
    pub host: String,
    /// Path component without the query, used for routing.
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub fn not_found() -> HttpResponse {
    HttpResponse {
        version: "HTTP/1.1".into(),
        status: 404,
        reason: "Not Found".into(),
        headers: vec![("Content-Type".into(), "text/plain".into())],
        body: b"Not Found".to_vec(),
    }
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn violation(what: &str) -> MasterError {
    MasterError::Protocol(what.to_string())
}

/// Read one line, CRLF stripped. `None` means EOF before any byte.
async fn read_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Option<String>, MasterError> {
    let mut raw = Vec::new();
    let n = r.read_until(b'\n', &mut raw).await?;
    if n == 0 {
        return Ok(None);
    }
    if raw.len() > MAX_LINE {
        return Err(violation("header line too long"));
    }
    while matches!(raw.last(), Some(b'\n') | Some(b'\r')) {
        raw.pop();
    }
    String::from_utf8(raw).map(Some).map_err(|_| violation("non-utf8 header"))
}

async fn read_headers<R: AsyncBufRead + Unpin>(
    r: &mut R,
) -> Result<Vec<(String, String)>, MasterError> {
    let mut headers = Vec::new();
    loop {
        let line = read_line(r)
            .await?
            .ok_or_else(|| violation("eof in headers"))?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(violation("too many headers"));
        }
        let (name, value) = line.split_once(':').ok_or_else(|| violation("bad header"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
}

async fn read_body<R: AsyncBufRead + Unpin>(
    r: &mut R,
    headers: &[(String, String)],
    eof_delimited_ok: bool,
) -> Result<Vec<u8>, MasterError> {
    if header(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        return read_chunked(r).await;
    }
    if let Some(value) = header(headers, "content-length") {
        let len: u64 = value.trim().parse().map_err(|_| violation("bad content-length"))?;
        if len > MAX_BODY {
            return Err(violation("body too large"));
        }
        let mut body = vec![0u8; len as usize];
        r.read_exact(&mut body).await?;
        return Ok(body);
    }
    if eof_delimited_ok {
        let mut body = Vec::new();
        r.take(MAX_BODY).read_to_end(&mut body).await?;
        return Ok(body);
    }
    Ok(Vec::new())
}

async fn read_chunked<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Vec<u8>, MasterError> {
    let mut body = Vec::new();
    loop {
        let line = read_line(r)
            .await?
            .ok_or_else(|| violation("eof in chunked body"))?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_str, 16).map_err(|_| violation("bad chunk size"))?;
        if body.len() as u64 + size > MAX_BODY {
            return Err(violation("body too large"));
        }
        if size == 0 {
            // Trailers, then the final blank line.
            loop {
                let trailer = read_line(r)
                    .await?
                    .ok_or_else(|| violation("eof in trailers"))?;
                if trailer.is_empty() {
                    return Ok(body);
                }
            }
        }
        let start = body.len();
        body.resize(start + size as usize, 0);
        r.read_exact(&mut body[start..]).await?;
        let mut crlf = [0u8; 2];
        r.read_exact(&mut crlf).await?;
    }
}

/// Split an absolute-form target into host and origin-form path.
fn split_target(target: &str) -> (Option<String>, String) {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = target.strip_prefix(scheme) {
            return match rest.find('/') {
                Some(i) => (Some(rest[..i].to_string()), rest[i..].to_string()),
                None => (Some(rest.to_string()), "/".to_string()),
            };
        }
    }
    (None, target.to_string())
}

/// Parse one request. `None` on clean EOF between requests.
pub async fn read_request<R: AsyncBufRead + Unpin>(
    r: &mut R,
) -> Result<Option<HttpRequest>, MasterError> {
    // A stray CRLF between keep-alive requests is tolerated.
    let mut line = String::new();
    for _ in 0..4 {
        match read_line(r).await? {
            None => return Ok(None),
            Some(l) if l.is_empty() => continue,
            Some(l) => {
                line = l;
                break;
            }
        }
    }
    if line.is_empty() {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => return Err(violation("bad request line")),
    };

    let headers = read_headers(r).await?;
    let (target_host, origin_path) = split_target(&target);
    let host = target_host
        .or_else(|| header(&headers, "host").map(|h| h.to_string()))
        .unwrap_or_default();
    let path = origin_path
        .split('?')
        .next()
        .unwrap_or("")
        .to_string();
    let body = read_body(r, &headers, false).await?;

    Ok(Some(HttpRequest {
        method,
        target,
        version,
        headers,
        body,
        host,
        path,
    }))
}

/// Parse one response to a request issued with `method`.
pub async fn read_response<R: AsyncBufRead + Unpin>(
    r: &mut R,
    method: &str,
) -> Result<HttpResponse, MasterError> {
    let line = read_line(r)
        .await?
        .ok_or_else(|| violation("eof before response"))?;
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or("").to_string();
    let status: u16 = parts
        .next()
        .unwrap_or("")
        .parse()
        .map_err(|_| violation("bad status line"))?;
    let reason = parts.next().unwrap_or("").to_string();
    if !version.starts_with("HTTP/") {
        return Err(violation("bad status line"));
    }

    let headers = read_headers(r).await?;
    let bodyless = method.eq_ignore_ascii_case("HEAD")
        || status / 100 == 1
        || status == 204
        || status == 304;
    let body = if bodyless {
        Vec::new()
    } else {
        read_body(r, &headers, true).await?
    };

    Ok(HttpResponse {
        version,
        status,
        reason,
        headers,
        body,
    })
}

/// Skip framing headers that we rewrite when re-serializing.
fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
}

/// Serialize a request in origin form for the downstream.
pub fn encode_request(request: &HttpRequest) -> Vec<u8> {
    let (_, origin_target) = split_target(&request.target);
    let mut out = Vec::with_capacity(256 + request.body.len());
    out.extend_from_slice(
        format!("{} {} {}\r\n", request.method, origin_target, request.version).as_bytes(),
    );
    if header(&request.headers, "host").is_none() && !request.host.is_empty() {
        out.extend_from_slice(format!("Host: {}\r\n", request.host).as_bytes());
    }
    let had_body_framing = request.headers.iter().any(|(k, _)| is_framing_header(k));
    for (name, value) in &request.headers {
        if is_framing_header(name) {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if had_body_framing || !request.body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", request.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}

pub fn encode_response(response: &HttpResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + response.body.len());
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            response.version, response.status, response.reason
        )
        .as_bytes(),
    );
    for (name, value) in &response.headers {
        if is_framing_header(name) {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    let bodyless = response.status / 100 == 1 || response.status == 204 || response.status == 304;
    if !bodyless {
        out.extend_from_slice(format!("Content-Length: {}\r\n", response.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&response.body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_parse_get_with_host_header() {
        let raw = b"GET /v2/thing?x=1 HTTP/1.1\r\nHost: y.b.example\r\nAccept: */*\r\n\r\n";
        let mut r = BufReader::new(&raw[..]);
        let request = read_request(&mut r).await.unwrap().unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.host, "y.b.example");
        assert_eq!(request.path, "/v2/thing");
        assert!(request.body.is_empty());
        assert!(read_request(&mut r).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parse_absolute_form_target() {
        let raw = b"GET http://x.a.example/path HTTP/1.1\r\n\r\n";
        let mut r = BufReader::new(&raw[..]);
        let request = read_request(&mut r).await.unwrap().unwrap();
        assert_eq!(request.host, "x.a.example");
        assert_eq!(request.path, "/path");

        let encoded = encode_request(&request);
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.starts_with("GET /path HTTP/1.1\r\n"));
        assert!(text.contains("Host: x.a.example\r\n"));
    }

    #[tokio::test]
    async fn test_parse_post_with_body() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello";
        let mut r = BufReader::new(&raw[..]);
        let request = read_request(&mut r).await.unwrap().unwrap();
        assert_eq!(request.body, b"hello");

        let encoded = encode_request(&request);
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn test_chunked_response_decoded() {
        let raw =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut r = BufReader::new(&raw[..]);
        let response = read_response(&mut r, "GET").await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello world");

        let text = String::from_utf8(encode_response(&response)).unwrap();
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(!text.to_ascii_lowercase().contains("transfer-encoding"));
    }

    #[tokio::test]
    async fn test_response_body_to_eof() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\nunbounded";
        let mut r = BufReader::new(&raw[..]);
        let response = read_response(&mut r, "GET").await.unwrap();
        assert_eq!(response.body, b"unbounded");
    }

    #[tokio::test]
    async fn test_head_response_has_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let mut r = BufReader::new(&raw[..]);
        let response = read_response(&mut r, "HEAD").await.unwrap();
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_not_found_shape() {
        let text = String::from_utf8(encode_response(&not_found())).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with("Not Found"));
    }
}
