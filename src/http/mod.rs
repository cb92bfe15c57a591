//! Hand-rolled HTTP/1.1 upstream client.
//!
//! Keeps the original header case on the wire, decodes chunked bodies with
//! trailer support, and reuses keepalive connections through a pool keyed by
//! `(scheme, host, port, tls, sni)`.

pub mod headers;
pub mod pool;

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::net::dns::{self, DnsError, Resolver};
use crate::net::socks::{SocksDialer, SocksError};
use crate::net::stream::{ClientStream, TlsClient};
use headers::HeaderTable;
use pool::{ConnectionPool, PoolKey, PooledIo};

const DEFAULT_USER_AGENT: &str = "WikiProxy/1.0";

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("dial failed: {0}")]
    Dial(#[source] std::io::Error),

    #[error("tls handshake failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("malformed response: {0}")]
    Parse(String),

    #[error(transparent)]
    Resolve(#[from] DnsError),

    #[error(transparent)]
    Socks(#[from] SocksError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Raw query string or form pairs to be `&`-joined and percent-encoded.
#[derive(Debug, Clone)]
pub enum Query {
    Raw(String),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Bytes(Bytes),
    /// Pre-split segments written back to back; lengths sum for
    /// `Content-Length`.
    Segments(Vec<Bytes>),
}

impl RequestBody {
    fn len(&self) -> usize {
        match self {
            RequestBody::Bytes(b) => b.len(),
            RequestBody::Segments(parts) => parts.iter().map(Bytes::len).sum(),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            RequestBody::Bytes(b) => out.extend_from_slice(b),
            RequestBody::Segments(parts) => {
                for part in parts {
                    out.extend_from_slice(part);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub method: String,
    pub path: String,
    pub query: Option<Query>,
    pub headers: HeaderTable,
    pub body: Option<RequestBody>,
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderTable,
    pub trailers: HeaderTable,
    pub body: Bytes,
}

pub struct Client {
    resolver: Arc<Resolver>,
    pool: ConnectionPool,
    proxy: Option<SocksDialer>,
    tls: TlsClient,
}

impl Client {
    pub fn new(resolver: Arc<Resolver>, proxy: Option<SocksDialer>) -> Self {
        Client {
            resolver,
            pool: ConnectionPool::default(),
            proxy,
            tls: TlsClient::new(),
        }
    }

    /// Send one request and read the complete response. The connection goes
    /// back to the pool only after a clean, keepalive-friendly exchange;
    /// every error path drops (closes) it instead.
    pub async fn fetch(&self, req: &UpstreamRequest) -> Result<UpstreamResponse, ClientError> {
        let tls = req.scheme.eq_ignore_ascii_case("https");
        let host_header = req
            .headers
            .get("host")
            .map(str::to_string)
            .unwrap_or_else(|| req.host.clone());
        let sni = sni_from_host(&host_header);

        let key = PoolKey {
            scheme: req.scheme.to_ascii_lowercase(),
            host: req.host.clone(),
            port: req.port,
            tls,
            sni: sni.clone(),
        };

        let mut io = match self.pool.checkout(&key) {
            Some(io) => {
                tracing::debug!("reusing pooled connection to {}:{}", req.host, req.port);
                io
            }
            None => self.dial(req, tls, &sni).await?,
        };

        let wire = serialize_request(req);
        io.get_mut().write_all(&wire).await?;
        io.get_mut().flush().await?;

        let mut keepalive = true;
        let response = read_response(&mut io, &req.method, &mut keepalive).await?;

        if keepalive {
            self.pool.checkin(key, io);
        }

        Ok(response)
    }

    async fn dial(
        &self,
        req: &UpstreamRequest,
        tls: bool,
        sni: &str,
    ) -> Result<PooledIo, ClientError> {
        let tcp = match &self.proxy {
            Some(dialer) => dialer.connect(&req.host, req.port, &self.resolver).await?,
            None => {
                let answers = self.resolver.resolve(&req.host).await?;
                let target = dns::pick(&answers);
                TcpStream::connect(format!("{}:{}", target, req.port))
                    .await
                    .map_err(ClientError::Dial)?
            }
        };

        let stream = if tls {
            self.tls.handshake(tcp, sni).await.map_err(ClientError::Tls)?
        } else {
            ClientStream::Plain(tcp)
        };

        Ok(BufReader::new(stream))
    }
}

/// SNI is the Host header, lowercased, without port or brackets.
fn sni_from_host(host: &str) -> String {
    let host = host.trim();
    let bare = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        host.rsplit_once(':')
            .filter(|(h, p)| !h.contains(':') && p.chars().all(|c| c.is_ascii_digit()))
            .map(|(h, _)| h)
            .unwrap_or(host)
    };
    bare.to_ascii_lowercase()
}

fn serialize_request(req: &UpstreamRequest) -> Vec<u8> {
    let method = req.method.to_ascii_uppercase();
    let path = if req.path.is_empty() { "/" } else { req.path.as_str() };

    let query = match &req.query {
        Some(Query::Raw(q)) if !q.is_empty() => format!("?{}", q),
        Some(Query::Form(pairs)) if !pairs.is_empty() => format!("?{}", form_encode(pairs)),
        _ => String::new(),
    };

    let mut headers = req.headers.clone();

    let chunked = headers
        .get("transfer-encoding")
        .map_or(false, |te| te.to_ascii_lowercase().contains("chunked"));
    if chunked {
        // A request must never carry both framings.
        headers.remove("content-length");
    } else if !headers.contains("content-length") {
        let length = match &req.body {
            Some(body) => Some(body.len()),
            None if matches!(method.as_str(), "POST" | "PUT" | "PATCH") => Some(0),
            None => None,
        };
        if let Some(length) = length {
            headers.set("Content-Length", length.to_string());
        }
    }

    if !headers.contains("user-agent") {
        headers.set("User-Agent", DEFAULT_USER_AGENT);
    }

    let mut wire = Vec::with_capacity(256);
    wire.extend_from_slice(format!("{} {}{} HTTP/1.1\r\n", method, path, query).as_bytes());
    headers.write_to(&mut wire);
    wire.extend_from_slice(b"\r\n");
    if let Some(body) = &req.body {
        body.write_to(&mut wire);
    }
    wire
}

fn form_encode(pairs: &[(String, String)]) -> String {
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
    pairs
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, NON_ALPHANUMERIC),
                utf8_percent_encode(v, NON_ALPHANUMERIC)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

async fn read_line<R: AsyncBufRead + Unpin>(io: &mut R) -> Result<String, ClientError> {
    let mut buf = Vec::new();
    let n = io.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(ClientError::Parse("unexpected end of stream".into()));
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn read_response<R: AsyncBufRead + Unpin>(
    io: &mut R,
    method: &str,
    keepalive: &mut bool,
) -> Result<UpstreamResponse, ClientError> {
    let status_line = read_line(io).await?;
    if !status_line.starts_with("HTTP/") {
        return Err(ClientError::Parse(format!(
            "bad status line {:?}",
            status_line
        )));
    }
    let version = status_line
        .get(5..8)
        .ok_or_else(|| ClientError::Parse(format!("bad status line {:?}", status_line)))?
        .to_string();
    let status: u16 = status_line
        .get(9..12)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ClientError::Parse(format!("bad status line {:?}", status_line)))?;
    let reason = status_line.get(13..).unwrap_or("").to_string();

    let mut headers = HeaderTable::new();
    loop {
        let line = read_line(io).await?;
        if line.is_empty() {
            break;
        }
        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                headers.append(name.trim(), value.trim());
            }
            _ => tracing::warn!("skipping malformed header line: {:?}", line),
        }
    }

    if version == "1.1" {
        let closes = headers
            .get("connection")
            .map_or(false, |c| c.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")));
        if closes {
            *keepalive = false;
        }
    } else {
        *keepalive = false;
    }

    let headless = method.eq_ignore_ascii_case("HEAD")
        || status / 100 == 1
        || status == 204
        || status == 304;

    let mut trailers = HeaderTable::new();
    let body = if headless {
        Bytes::new()
    } else if is_chunked(&headers) {
        read_chunked(io, &headers, &mut trailers).await?
    } else if let Some(length) = headers.get("content-length") {
        let length: usize = length
            .trim()
            .parse()
            .map_err(|_| ClientError::Parse(format!("bad content-length {:?}", length)))?;
        let mut buf = vec![0u8; length];
        io.read_exact(&mut buf).await?;
        Bytes::from(buf)
    } else {
        // EOF-delimited; the connection is spent.
        *keepalive = false;
        let mut buf = Vec::new();
        io.read_to_end(&mut buf).await?;
        Bytes::from(buf)
    };

    // Trailer fields become visible through normal header lookup but never
    // displace a header that already arrived.
    headers.merge_missing(&trailers);

    Ok(UpstreamResponse {
        version,
        status,
        reason,
        headers,
        trailers,
        body,
    })
}

fn is_chunked(headers: &HeaderTable) -> bool {
    headers
        .get("transfer-encoding")
        .map_or(false, |te| te.to_ascii_lowercase().contains("chunked"))
}

async fn read_chunked<R: AsyncBufRead + Unpin>(
    io: &mut R,
    headers: &HeaderTable,
    trailers: &mut HeaderTable,
) -> Result<Bytes, ClientError> {
    let mut body = Vec::new();
    loop {
        let line = read_line(io).await?;
        let size_text = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| ClientError::Parse(format!("bad chunk size {:?}", line)))?;
        if size == 0 {
            break;
        }
        let start = body.len();
        body.resize(start + size, 0);
        io.read_exact(&mut body[start..]).await?;

        let mut crlf = [0u8; 2];
        io.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(ClientError::Parse("missing chunk terminator".into()));
        }
    }

    // One additional header block follows the final chunk; it is only
    // honored when the response advertised trailers.
    let advertised = headers.contains("trailer");
    loop {
        let line = read_line(io).await?;
        if line.is_empty() {
            break;
        }
        match line.split_once(':') {
            Some((name, value)) if advertised => trailers.append(name.trim(), value.trim()),
            Some(_) => tracing::debug!("ignoring unadvertised trailer line: {:?}", line),
            None => tracing::warn!("skipping malformed trailer line: {:?}", line),
        }
    }

    Ok(Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsConfig;
    use tokio::net::TcpListener;

    fn request(method: &str, path: &str) -> UpstreamRequest {
        UpstreamRequest {
            scheme: "http".into(),
            host: "en.wikipedia.org".into(),
            port: 80,
            method: method.into(),
            path: path.into(),
            query: None,
            headers: HeaderTable::new(),
            body: None,
        }
    }

    fn wire_text(req: &UpstreamRequest) -> String {
        String::from_utf8(serialize_request(req)).unwrap()
    }

    async fn parse(raw: &str, method: &str, keepalive: &mut bool) -> UpstreamResponse {
        let mut io = BufReader::new(raw.as_bytes());
        read_response(&mut io, method, keepalive).await.unwrap()
    }

    #[test]
    fn serialization_basics() {
        let mut req = request("get", "");
        req.headers.set("Host", "en.wikipedia.org");
        let text = wire_text(&req);
        assert!(text.starts_with("GET / HTTP/1.1\r\n"), "{text}");
        assert!(text.contains("Host: en.wikipedia.org\r\n"));
        assert!(text.contains(&format!("User-Agent: {}\r\n", DEFAULT_USER_AGENT)));
        // No body and not POST/PUT/PATCH: no implicit Content-Length.
        assert!(!text.to_ascii_lowercase().contains("content-length"));
    }

    #[test]
    fn query_handling() {
        let mut req = request("GET", "/w/index.php");
        req.query = Some(Query::Raw("title=Foo&action=raw".into()));
        assert!(wire_text(&req).starts_with("GET /w/index.php?title=Foo&action=raw HTTP/1.1\r\n"));

        req.query = Some(Query::Raw(String::new()));
        assert!(wire_text(&req).starts_with("GET /w/index.php HTTP/1.1\r\n"));

        req.query = Some(Query::Form(vec![("search".into(), "a b".into())]));
        assert!(wire_text(&req).starts_with("GET /w/index.php?search=a%20b HTTP/1.1\r\n"));
    }

    #[test]
    fn content_length_rules() {
        let mut req = request("post", "/submit");
        assert!(wire_text(&req).contains("Content-Length: 0\r\n"));

        req.body = Some(RequestBody::Bytes(Bytes::from_static(b"hello")));
        assert!(wire_text(&req).contains("Content-Length: 5\r\n"));

        req.body = Some(RequestBody::Segments(vec![
            Bytes::from_static(b"hel"),
            Bytes::from_static(b"lo!"),
        ]));
        let text = wire_text(&req);
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\nhello!"));
    }

    #[test]
    fn chunked_strips_content_length() {
        let mut req = request("POST", "/submit");
        req.headers.set("Content-Length", "999");
        req.headers.set("Transfer-Encoding", "chunked");
        let text = wire_text(&req);
        assert!(!text.to_ascii_lowercase().contains("content-length"));
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    }

    #[test]
    fn sni_derivation() {
        assert_eq!(sni_from_host("EN.Wikipedia.ORG"), "en.wikipedia.org");
        assert_eq!(sni_from_host("en.wikipedia.org:8443"), "en.wikipedia.org");
        assert_eq!(sni_from_host("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(sni_from_host("[2001:db8::1]"), "2001:db8::1");
    }

    #[tokio::test]
    async fn parses_content_length_body() {
        let mut keepalive = true;
        let resp = parse(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\n\r\nhello",
            "GET",
            &mut keepalive,
        )
        .await;
        assert_eq!(resp.version, "1.1");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.body.as_ref(), b"hello");
        assert!(keepalive);
    }

    #[tokio::test]
    async fn chunked_decode() {
        let mut keepalive = true;
        let resp = parse(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n5\r\nhello\r\n0\r\n\r\n",
            "GET",
            &mut keepalive,
        )
        .await;
        assert_eq!(resp.body.as_ref(), b"abchello");
        assert!(keepalive);
    }

    #[tokio::test]
    async fn trailers_merge_as_fallback() {
        let mut keepalive = true;
        let resp = parse(
            "HTTP/1.1 200 OK\r\nTrailer: X-Checksum\r\nTransfer-Encoding: chunked\r\n\r\n\
             4\r\nwiki\r\n0\r\nX-Checksum: abc123\r\nContent-Type: nope\r\n\r\n",
            "GET",
            &mut keepalive,
        )
        .await;
        assert_eq!(resp.body.as_ref(), b"wiki");
        assert_eq!(resp.headers.get("x-checksum"), Some("abc123"));
        assert_eq!(resp.trailers.get("X-Checksum"), Some("abc123"));
        // A trailer never overwrites... there was no Content-Type header, so
        // the trailer copy is visible.
        assert_eq!(resp.headers.get("content-type"), Some("nope"));
    }

    #[tokio::test]
    async fn connection_close_clears_keepalive() {
        let mut keepalive = true;
        parse(
            "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
            "GET",
            &mut keepalive,
        )
        .await;
        assert!(!keepalive);
    }

    #[tokio::test]
    async fn head_and_no_content_skip_body() {
        let mut keepalive = true;
        let resp = parse(
            "HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n",
            "HEAD",
            &mut keepalive,
        )
        .await;
        assert!(resp.body.is_empty());

        let resp = parse("HTTP/1.1 204 No Content\r\n\r\n", "GET", &mut keepalive).await;
        assert_eq!(resp.status, 204);
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn eof_delimited_body() {
        let mut keepalive = true;
        let resp = parse(
            "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nstream until the end",
            "GET",
            &mut keepalive,
        )
        .await;
        assert_eq!(resp.version, "1.0");
        assert_eq!(resp.body.as_ref(), b"stream until the end");
        assert!(!keepalive);
    }

    #[tokio::test]
    async fn repeated_headers_become_lists() {
        let mut keepalive = true;
        let resp = parse(
            "HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nContent-Length: 0\r\n\r\n",
            "GET",
            &mut keepalive,
        )
        .await;
        let values: Vec<&str> = resp.headers.get_value("set-cookie").unwrap().iter().collect();
        assert_eq!(values, vec!["a=1", "b=2"]);
    }

    #[tokio::test]
    async fn malformed_header_lines_are_skipped() {
        let mut keepalive = true;
        let resp = parse(
            "HTTP/1.1 200 OK\r\ngarbage line\r\nContent-Length: 2\r\n\r\nok",
            "GET",
            &mut keepalive,
        )
        .await;
        assert_eq!(resp.body.as_ref(), b"ok");
        assert_eq!(resp.headers.len(), 1);
    }

    /// Two fetches over one upstream socket prove pool reuse.
    #[tokio::test]
    async fn fetch_reuses_keepalive_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            for body in ["first", "second"] {
                let mut head = Vec::new();
                loop {
                    let mut byte = [0u8; 1];
                    sock.read_exact(&mut byte).await.unwrap();
                    head.push(byte[0]);
                    if head.ends_with(b"\r\n\r\n") {
                        break;
                    }
                }
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                sock.write_all(reply.as_bytes()).await.unwrap();
            }
        });

        let resolver = Arc::new(Resolver::new(DnsConfig::default()));
        let client = Client::new(resolver, None);

        let mut req = request("GET", "/a");
        req.host = "127.0.0.1".into();
        req.port = port;
        req.headers.set("Host", "127.0.0.1");

        let first = client.fetch(&req).await.unwrap();
        assert_eq!(first.body.as_ref(), b"first");

        req.path = "/b".into();
        let second = client.fetch(&req).await.unwrap();
        assert_eq!(second.body.as_ref(), b"second");

        server.await.unwrap();
    }
}
