//! HTTP listener and the per-request proxy pipeline.
//!
//! The listener terminates plain HTTP (client TLS belongs to the terminator
//! in front of us), adapts each request into a [`ClientRequest`] descriptor,
//! and runs it through the orchestrator: admission gate, host routing,
//! reverse path mapping, upstream fetch, then forward rewriting of the
//! `Location` header and text bodies.

use std::borrow::Cow;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http::{header, HeaderName, HeaderValue, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::gate::{Admission, AdmissionGate};
use crate::http::headers::HeaderTable;
use crate::http::{Client, Query, RequestBody, UpstreamRequest};
use crate::net::dns::Resolver;
use crate::net::socks::SocksDialer;
use crate::wiki::{self, Bindings, RewriteCtx};

/// Response body MIME prefixes that go through the URL rewriter.
const REWRITE_MIMES: [&str; 3] = ["text/html", "text/javascript", "text/css"];

/// Request body as handed over by the listener: in memory, or spilled to a
/// temp file by a listener that buffers large uploads on disk.
pub enum IncomingBody {
    Bytes(Bytes),
    File(PathBuf),
}

impl IncomingBody {
    /// Read the body once, draining the spilled file if there is one.
    pub async fn read(self) -> std::io::Result<Bytes> {
        match self {
            IncomingBody::Bytes(bytes) => Ok(bytes),
            IncomingBody::File(path) => tokio::fs::read(path).await.map(Bytes::from),
        }
    }
}

/// The listener-facing request descriptor.
pub struct ClientRequest {
    pub peer: IpAddr,
    pub user_agent: String,
    /// Verbatim Host header.
    pub host: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderTable,
    pub body: IncomingBody,
}

/// What the core writes back through the listener.
pub struct Reply {
    pub status: u16,
    pub headers: HeaderTable,
    pub body: Bytes,
}

impl Reply {
    fn text(status: u16, body: &str) -> Reply {
        Reply {
            status,
            headers: HeaderTable::new(),
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }
}

pub struct App {
    bindings: Bindings,
    gate: AdmissionGate,
    client: Client,
    scheme: String,
}

impl App {
    pub async fn from_config(config: &Config) -> crate::Result<App> {
        let resolver = Arc::new(Resolver::new(config.dns.clone()));
        let proxy = match &config.proxy {
            Some(url) => {
                let dialer = SocksDialer::from_url(url, &resolver).await?;
                tracing::info!(
                    "upstream egress via {} (remote resolve: {})",
                    dialer.proxy_host(),
                    dialer.is_remote_resolve()
                );
                Some(dialer)
            }
            None => None,
        };

        Ok(App {
            bindings: Bindings::compile(&config.wikis)?,
            gate: AdmissionGate::new(&config.auth),
            client: Client::new(resolver, proxy),
            scheme: config.server.scheme.clone(),
        })
    }

    /// The per-request pipeline. Resolver, dial, handshake, and upstream
    /// I/O failures all collapse into one client-visible 400; the detail
    /// stays in the log.
    pub async fn dispatch(&self, req: ClientRequest) -> Reply {
        match self.gate.check(req.peer, &req.user_agent) {
            Admission::MissingUserAgent => return Reply::text(400, "bad request"),
            Admission::Challenge { status, body } => {
                return Reply {
                    status,
                    headers: HeaderTable::new(),
                    body: Bytes::from(body),
                };
            }
            Admission::Granted => {}
        }

        let (host, hport) = wiki::split_hport(&req.host);
        let binding = match self.bindings.by_host(host) {
            Some(binding) => binding,
            None => return Reply::text(404, "not found"),
        };

        let body = match req.body.read().await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!("cannot read request body: {}", err);
                return Reply::text(400, "bad request: cannot proxy request");
            }
        };

        let (upstream_domain, upstream_path) = binding.resolve_path(&req.path);
        let (upstream_host, upstream_port) = wiki::split_hport(upstream_domain);
        let upstream_port = upstream_port
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .unwrap_or(if self.scheme.eq_ignore_ascii_case("https") {
                443
            } else {
                80
            });

        let mut upstream_headers = req.headers.clone();
        upstream_headers.set("Host", upstream_domain);
        // Upstream bodies stay identity-encoded so the rewriter sees plain
        // text; hop-by-hop intent is ours, not the client's.
        upstream_headers.remove("accept-encoding");
        upstream_headers.remove("connection");
        upstream_headers.remove("proxy-connection");
        // The listener already decoded any chunked request body.
        upstream_headers.remove("transfer-encoding");

        let upstream = UpstreamRequest {
            scheme: self.scheme.clone(),
            host: upstream_host.to_string(),
            port: upstream_port,
            method: req.method.clone(),
            path: upstream_path,
            query: req.query.clone().map(Query::Raw),
            headers: upstream_headers,
            body: if body.is_empty() {
                None
            } else {
                Some(RequestBody::Bytes(body))
            },
        };

        let mut response = match self.client.fetch(&upstream).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    "proxying {} {} to {} failed: {}",
                    req.method,
                    req.path,
                    upstream.host,
                    err
                );
                return Reply::text(400, "bad request: cannot proxy request");
            }
        };

        tracing::debug!(
            "{} {}{} -> {} {} ({} bytes)",
            req.method,
            req.host,
            req.path,
            upstream.host,
            response.status,
            response.body.len()
        );

        // The listener speaks for itself on connection handling; the
        // decoded body also invalidates upstream framing headers. Trailer
        // names are not echoed, though merged trailer fields already sit in
        // the header table.
        response.headers.remove("connection");
        response.headers.remove("trailer");
        response.headers.remove("transfer-encoding");
        response.headers.remove("keep-alive");

        let ctx = RewriteCtx {
            proxy_host: binding.host(),
            hport,
        };

        if let Some(location) = response.headers.get("location").map(str::to_string) {
            if let Cow::Owned(rewritten) = binding.rewrite_text(&location, &ctx) {
                response.headers.set("location", rewritten);
            }
        }

        // HEAD and no-body statuses keep their original framing headers.
        let headless = req.method.eq_ignore_ascii_case("HEAD")
            || response.status / 100 == 1
            || response.status == 204
            || response.status == 304;

        let body = if !headless && should_rewrite(response.headers.get("content-type")) {
            let rewritten = match binding.rewrite_bytes(&response.body, &ctx) {
                Cow::Borrowed(_) => None,
                Cow::Owned(rewritten) => Some(rewritten),
            };
            let body = match rewritten {
                Some(rewritten) => Bytes::from(rewritten),
                None => response.body,
            };
            response
                .headers
                .set("Content-Length", body.len().to_string());
            body
        } else {
            response.body
        };

        Reply {
            status: response.status,
            headers: response.headers,
            body,
        }
    }
}

/// MIME gate for body rewriting: compare the Content-Type with its
/// parameters stripped.
fn should_rewrite(content_type: Option<&str>) -> bool {
    match content_type {
        Some(value) => {
            let mime = value.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            REWRITE_MIMES.contains(&mime.as_str())
        }
        None => false,
    }
}

/// Boot the runtime and start the listener.
#[tokio::main(flavor = "multi_thread")]
pub async fn run(config: Config, debug: bool) -> crate::Result<()> {
    init_tracing(debug);

    tracing::info!("OS: {}", std::env::consts::OS);
    tracing::info!("Arch: {}", std::env::consts::ARCH);
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let listener = TcpListener::bind(config.server.bind).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    serve_on(listener, config).await
}

/// Accept loop over an already-bound listener; integration tests drive this
/// directly with an ephemeral port.
pub async fn serve_on(listener: TcpListener, config: Config) -> crate::Result<()> {
    let app = Arc::new(App::from_config(&config).await?);
    let sem = Arc::new(Semaphore::new(config.server.concurrent));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let io = TokioIo::new(stream);
                let app = app.clone();
                let permit = sem.clone().acquire_owned().await;

                tokio::task::spawn(async move {
                    let _permit = permit;
                    let peer_ip = peer.ip();
                    let service = service_fn(move |req| {
                        let app = app.clone();
                        async move { app.handle(peer_ip, req).await }
                    });
                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .await
                    {
                        tracing::warn!("failed to serve connection: {:?}", err);
                    }
                });
            }
        }
    }

    Ok(())
}

impl App {
    /// Adapt a hyper request into the listener contract and the reply back.
    async fn handle(
        &self,
        peer: IpAddr,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let user_agent = header_str(&req, header::USER_AGENT);
        let host = header_str(&req, header::HOST);
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        let mut headers = HeaderTable::new();
        for (name, value) in req.headers() {
            match value.to_str() {
                Ok(value) => headers.append(name.as_str(), value),
                Err(_) => tracing::warn!("dropping non-text header {:?}", name),
            }
        }

        let body = req.into_body().collect().await?.to_bytes();

        let reply = self
            .dispatch(ClientRequest {
                peer,
                user_agent,
                host,
                method,
                path,
                query,
                headers,
                body: IncomingBody::Bytes(body),
            })
            .await;

        let mut response = Response::builder()
            .status(StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY));
        if let Some(header_map) = response.headers_mut() {
            for (name, value) in reply.headers.iter() {
                let name = match HeaderName::from_bytes(name.as_bytes()) {
                    Ok(name) => name,
                    Err(_) => {
                        tracing::warn!("dropping invalid header name {:?}", name);
                        continue;
                    }
                };
                for v in value.iter() {
                    match HeaderValue::from_str(v) {
                        Ok(v) => {
                            header_map.append(name.clone(), v);
                        }
                        Err(_) => tracing::warn!("dropping invalid value for {:?}", name),
                    }
                }
            }
        }

        Ok(response
            .body(full(reply.body))
            .unwrap_or_else(|_| Response::new(full(Bytes::from_static(b"internal error")))))
    }
}

fn header_str(req: &Request<Incoming>, name: header::HeaderName) -> String {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn init_tracing(debug: bool) {
    if debug {
        std::env::set_var("RUST_LOG", "debug");
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
