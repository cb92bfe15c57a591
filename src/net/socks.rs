//! SOCKS5 client dialer (RFC 1928, CONNECT only, no-auth only).

use std::fmt;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::net::addr::{self, AddrError};
use crate::net::dns::{self, DnsError, Resolver};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(thiserror::Error, Debug)]
pub enum SocksError {
    #[error("invalid proxy url: {0:?}")]
    BadProxyUrl(String),

    #[error("proxy unreachable: {0}")]
    ProxyUnreachable(#[source] std::io::Error),

    #[error("socks5 protocol error: {0}")]
    Protocol(String),

    #[error("proxy selected unsupported auth method {0:#04x}")]
    UnsupportedAuth(u8),

    #[error("proxy refused connect: {0}")]
    ConnectRefused(&'static str),

    #[error(transparent)]
    Resolve(#[from] DnsError),

    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocksScheme {
    /// Target names are resolved locally before CONNECT.
    Socks5,
    /// Target names are sent to the proxy for resolution.
    Socks5h,
}

impl fmt::Display for SocksScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksScheme::Socks5 => write!(f, "socks5"),
            SocksScheme::Socks5h => write!(f, "socks5h"),
        }
    }
}

/// Upstream egress dialer. The proxy host is resolved once at construction;
/// targets are dialed per request through [`SocksDialer::connect`].
pub struct SocksDialer {
    scheme: SocksScheme,
    proxy_host: String,
    proxy_port: u16,
    proxy_addr: String,
}

impl SocksDialer {
    /// Parse a `socks5[h]://host:port` URL and resolve the proxy host.
    pub async fn from_url(url: &str, resolver: &Resolver) -> Result<SocksDialer, SocksError> {
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("socks5h://") {
            (SocksScheme::Socks5h, rest)
        } else if let Some(rest) = url.strip_prefix("socks5://") {
            (SocksScheme::Socks5, rest)
        } else {
            return Err(SocksError::BadProxyUrl(url.to_string()));
        };

        let rest = rest.strip_suffix('/').unwrap_or(rest);
        let (host, port) = split_host_port(rest).ok_or_else(|| SocksError::BadProxyUrl(url.to_string()))?;

        let answers = resolver.resolve(host).await?;
        let proxy_addr = dns::pick(&answers).to_string();

        Ok(SocksDialer {
            scheme,
            proxy_host: host.to_string(),
            proxy_port: port,
            proxy_addr,
        })
    }

    /// Whether target names are resolved on the proxy side.
    pub fn is_remote_resolve(&self) -> bool {
        self.scheme == SocksScheme::Socks5h
    }

    pub fn proxy_host(&self) -> &str {
        &self.proxy_host
    }

    /// CONNECT to `target_host:target_port` through the proxy and hand back
    /// the tunneled socket. Each handshake step fails with its own error;
    /// there are no retries here.
    pub async fn connect(
        &self,
        target_host: &str,
        target_port: u16,
        resolver: &Resolver,
    ) -> Result<TcpStream, SocksError> {
        let mut stream = TcpStream::connect(format!("{}:{}", self.proxy_addr, self.proxy_port))
            .await
            .map_err(SocksError::ProxyUnreachable)?;

        // Greeting: no-auth plus the RFC's GSSAPI filler method.
        stream
            .write_all(&[SOCKS_VERSION, 0x02, METHOD_NO_AUTH, 0x01])
            .await?;

        let mut selection = [0u8; 2];
        stream.read_exact(&mut selection).await?;
        if selection[0] != SOCKS_VERSION {
            return Err(SocksError::Protocol(format!(
                "bad greeting version {:#04x}",
                selection[0]
            )));
        }
        if selection[1] != METHOD_NO_AUTH {
            return Err(SocksError::UnsupportedAuth(selection[1]));
        }

        let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
        self.encode_target(&mut request, target_host, resolver).await?;
        request.extend_from_slice(&addr::be16(target_port));
        stream.write_all(&request).await?;

        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        if reply[0] != SOCKS_VERSION {
            return Err(SocksError::Protocol(format!(
                "bad reply version {:#04x}",
                reply[0]
            )));
        }
        if reply[1] != 0x00 {
            return Err(SocksError::ConnectRefused(reply_reason(reply[1])));
        }

        // Drain BND.ADDR and BND.PORT; the length depends on the reply ATYPE.
        match reply[3] {
            ATYP_IPV4 => {
                let mut rest = [0u8; 6];
                stream.read_exact(&mut rest).await?;
            }
            ATYP_IPV6 => {
                let mut rest = [0u8; 18];
                stream.read_exact(&mut rest).await?;
            }
            ATYP_DOMAIN => {
                let len = stream.read_u8().await? as usize;
                let mut rest = vec![0u8; len + 2];
                stream.read_exact(&mut rest).await?;
            }
            other => {
                return Err(SocksError::Protocol(format!(
                    "bad reply address type {:#04x}",
                    other
                )));
            }
        }

        Ok(stream)
    }

    /// Append `[ATYPE, ADDR]` for the target. Local resolution applies for
    /// plain socks5 unless the target is already a textual address.
    async fn encode_target(
        &self,
        request: &mut Vec<u8>,
        target_host: &str,
        resolver: &Resolver,
    ) -> Result<(), SocksError> {
        let resolved;
        let target = if self.is_remote_resolve() {
            target_host
        } else {
            let answers = resolver.resolve(target_host).await?;
            resolved = dns::pick(&answers).to_string();
            resolved.as_str()
        };

        if addr::is_ipv4(target) {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&addr::pack_ipv4(target)?);
        } else if addr::is_ipv6(target, true).is_some() {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&addr::pack_ipv6(target)?);
        } else {
            if target.len() > 255 {
                return Err(SocksError::Protocol(format!(
                    "target domain too long: {} bytes",
                    target.len()
                )));
            }
            request.push(ATYP_DOMAIN);
            request.push(target.len() as u8);
            request.extend_from_slice(target.as_bytes());
        }
        Ok(())
    }
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

/// Split `host:port`, tolerating a bracketed IPv6 host.
fn split_host_port(s: &str) -> Option<(&str, u16)> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']')?;
        let port = rest[end + 1..].strip_prefix(':')?;
        (&rest[..end], port)
    } else {
        let (host, port) = s.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        (host, port)
    };
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsConfig;
    use tokio::net::TcpListener;

    fn resolver() -> Resolver {
        Resolver::new(DnsConfig::default())
    }

    async fn dialer(url: String) -> SocksDialer {
        SocksDialer::from_url(&url, &resolver()).await.unwrap()
    }

    #[test]
    fn host_port_splitting() {
        assert_eq!(split_host_port("127.0.0.1:1080"), Some(("127.0.0.1", 1080)));
        assert_eq!(split_host_port("proxy.example:9050"), Some(("proxy.example", 9050)));
        assert_eq!(split_host_port("[::1]:1080"), Some(("::1", 1080)));
        assert_eq!(split_host_port("noport"), None);
        assert_eq!(split_host_port(":1080"), None);
        assert_eq!(split_host_port("::1:1080"), None);
    }

    #[tokio::test]
    async fn url_parsing() {
        let d = dialer("socks5h://127.0.0.1:1080".into()).await;
        assert!(d.is_remote_resolve());
        assert_eq!(d.proxy_host(), "127.0.0.1");
        assert_eq!(d.proxy_port, 1080);

        let d = dialer("socks5://127.0.0.1:9050/".into()).await;
        assert!(!d.is_remote_resolve());
        assert_eq!(d.proxy_port, 9050);

        assert!(matches!(
            SocksDialer::from_url("http://127.0.0.1:8080", &resolver()).await,
            Err(SocksError::BadProxyUrl(_))
        ));
        assert!(matches!(
            SocksDialer::from_url("socks5://noport", &resolver()).await,
            Err(SocksError::BadProxyUrl(_))
        ));
    }

    /// Mock proxy asserting the exact greeting bytes, then granting CONNECT
    /// for a domain target.
    #[tokio::test]
    async fn connect_handshake_socks5h() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 4];
            sock.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x01]);
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            sock.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..3], &[0x05, 0x01, 0x00]);
            assert_eq!(head[3], ATYP_DOMAIN);
            let len = sock.read_u8().await.unwrap() as usize;
            let mut name = vec![0u8; len];
            sock.read_exact(&mut name).await.unwrap();
            assert_eq!(name, b"en.wikipedia.org");
            let mut port_buf = [0u8; 2];
            sock.read_exact(&mut port_buf).await.unwrap();
            assert_eq!(u16::from_be_bytes(port_buf), 443);

            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            // Prove the tunnel carries bytes.
            let mut probe = [0u8; 4];
            sock.read_exact(&mut probe).await.unwrap();
            assert_eq!(&probe, b"ping");
        });

        let d = dialer(format!("socks5h://127.0.0.1:{}", port)).await;
        let mut tunnel = d
            .connect("en.wikipedia.org", 443, &resolver())
            .await
            .unwrap();
        tunnel.write_all(b"ping").await.unwrap();
        server.await.unwrap();
    }

    /// Plain socks5 against a textual IPv4 target encodes raw address bytes.
    #[tokio::test]
    async fn connect_encodes_ipv4_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 4];
            sock.read_exact(&mut greeting).await.unwrap();
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            sock.read_exact(&mut request).await.unwrap();
            assert_eq!(
                request,
                [0x05, 0x01, 0x00, ATYP_IPV4, 192, 0, 2, 1, 0x00, 0x50]
            );
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let d = dialer(format!("socks5://127.0.0.1:{}", port)).await;
        d.connect("192.0.2.1", 80, &resolver()).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_auth_demand() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 4];
            sock.read_exact(&mut greeting).await.unwrap();
            sock.write_all(&[0x05, 0xff]).await.unwrap();
        });

        let d = dialer(format!("socks5h://127.0.0.1:{}", port)).await;
        match d.connect("en.wikipedia.org", 443, &resolver()).await {
            Err(SocksError::UnsupportedAuth(0xff)) => {}
            other => panic!("expected UnsupportedAuth, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn surfaces_refused_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 4];
            sock.read_exact(&mut greeting).await.unwrap();
            sock.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = vec![0u8; 4 + 1 + "blocked.example".len() + 2];
            sock.read_exact(&mut request).await.unwrap();
            sock.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let d = dialer(format!("socks5h://127.0.0.1:{}", port)).await;
        match d.connect("blocked.example", 80, &resolver()).await {
            Err(SocksError::ConnectRefused(reason)) => {
                assert_eq!(reason, "connection refused")
            }
            other => panic!("expected ConnectRefused, got {:?}", other.err()),
        }
    }
}
