use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
///
/// Everything except the wiki bindings has sensible defaults, so a minimal
/// config file only carries a `wikis` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub wikis: Vec<WikiConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    /// Upstream egress proxy URL, `socks5://host:port` or `socks5h://host:port`.
    #[serde(default)]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Scheme the clients reach this service with (TLS termination happens in
    /// front of us). Drives the upstream scheme and default port.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Cap on concurrently served connections.
    #[serde(default = "default_concurrent")]
    pub concurrent: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
            scheme: default_scheme(),
            concurrent: default_concurrent(),
        }
    }
}

/// One proxy-host to wiki-domain binding.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WikiConfig {
    /// Client-facing host, e.g. `en.wiki.example`.
    pub host: String,
    /// Primary upstream domain, e.g. `en.wikipedia.org`.
    pub domain: String,
    /// Auxiliary domains as `[wiki_domain, path_prefix]` pairs, in match
    /// order. Prefixes begin and end with `/`.
    #[serde(default)]
    pub maps: Vec<(String, String)>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Status code used for challenge replies.
    #[serde(default = "default_auth_code")]
    pub code: u16,
    /// Number of challenges before admission.
    #[serde(default = "default_auth_retries")]
    pub retries: u64,
    /// Lifetime of the challenge counter.
    #[serde(default = "default_auth_wait_time")]
    pub wait_time_s: u64,
    /// Lifetime of an admission.
    #[serde(default = "default_auth_ttl")]
    pub ttl_s: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            code: default_auth_code(),
            retries: default_auth_retries(),
            wait_time_s: default_auth_wait_time(),
            ttl_s: default_auth_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    /// Upstream nameservers, queried over plain UDP/TCP on port 53.
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<IpAddr>,
    #[serde(default = "default_dns_timeout")]
    pub timeout_s: u64,
    /// Retransmit count per query.
    #[serde(default = "default_dns_retrans")]
    pub retrans: usize,
    /// Query AAAA before A.
    #[serde(default)]
    pub prefer_ipv6: bool,
    #[serde(default)]
    pub cache: DnsCacheConfig,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            nameservers: default_nameservers(),
            timeout_s: default_dns_timeout(),
            retrans: default_dns_retrans(),
            prefer_ipv6: false,
            cache: DnsCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsCacheConfig {
    #[serde(default = "default_dns_cache_size")]
    pub size: usize,
    #[serde(default = "default_dns_cache_ttl")]
    pub ttl_s: u64,
}

impl Default for DnsCacheConfig {
    fn default() -> Self {
        DnsCacheConfig {
            size: default_dns_cache_size(),
            ttl_s: default_dns_cache_ttl(),
        }
    }
}

fn default_bind() -> SocketAddr {
    "127.0.0.1:8100".parse().expect("static default bind")
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_concurrent() -> usize {
    100
}

fn default_auth_code() -> u16 {
    404
}

fn default_auth_retries() -> u64 {
    6
}

fn default_auth_wait_time() -> u64 {
    10
}

fn default_auth_ttl() -> u64 {
    3600
}

fn default_nameservers() -> Vec<IpAddr> {
    vec![
        "1.1.1.1".parse().expect("static nameserver"),
        "8.8.8.8".parse().expect("static nameserver"),
    ]
}

fn default_dns_timeout() -> u64 {
    2
}

fn default_dns_retrans() -> usize {
    2
}

fn default_dns_cache_size() -> usize {
    256
}

fn default_dns_cache_ttl() -> u64 {
    600
}

impl Config {
    /// Read and validate a YAML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Enforce the binding invariants: unique proxy hosts, at most one entry
    /// per wiki domain inside a binding, `/…/`-shaped prefixes, and a
    /// well-formed proxy URL scheme if one is set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wikis.is_empty() {
            return Err(ConfigError::Invalid("no wiki bindings configured".into()));
        }

        let mut hosts = std::collections::HashSet::new();
        for wiki in &self.wikis {
            if !hosts.insert(wiki.host.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate proxy host {:?}",
                    wiki.host
                )));
            }

            let mut domains = std::collections::HashSet::new();
            domains.insert(wiki.domain.as_str());
            for (domain, prefix) in &wiki.maps {
                if !domains.insert(domain.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "domain {:?} mapped twice under host {:?}",
                        domain, wiki.host
                    )));
                }
                if !prefix.starts_with('/') || !prefix.ends_with('/') {
                    return Err(ConfigError::Invalid(format!(
                        "prefix {:?} for domain {:?} must begin and end with '/'",
                        prefix, domain
                    )));
                }
            }
        }

        if let Some(proxy) = &self.proxy {
            if !proxy.starts_with("socks5://") && !proxy.starts_with("socks5h://") {
                return Err(ConfigError::Invalid(format!(
                    "proxy URL {:?} must use the socks5:// or socks5h:// scheme",
                    proxy
                )));
            }
        }

        Ok(())
    }

    /// Commented sample config for `wikiproxy generate`.
    pub fn sample() -> &'static str {
        r#"# WikiProxy sample configuration.

server:
  # Address the HTTP listener binds to. TLS is terminated in front of us.
  bind: 127.0.0.1:8100
  # Scheme clients use to reach the proxy; also selects the upstream scheme.
  scheme: https
  # Concurrent connection cap.
  concurrent: 100

wikis:
  - host: en.wiki.example
    domain: en.wikipedia.org
    maps:
      - [en.m.wikipedia.org, /.wp-mobile/]
      - [upload.wikimedia.org, /.wp-upload/]
      - [commons.wikimedia.org, /.wp-commons/]
  - host: de.wiki.example
    domain: de.wikipedia.org
    maps:
      - [de.m.wikipedia.org, /.wp-mobile/]
      - [upload.wikimedia.org, /.wp-upload/]

auth:
  # Challenge reply status; clients must retry until admitted.
  code: 404
  retries: 6
  wait_time_s: 10
  ttl_s: 3600

dns:
  nameservers: [1.1.1.1, 8.8.8.8]
  timeout_s: 2
  retrans: 2
  prefer_ipv6: false
  cache:
    size: 256
    ttl_s: 600

# Optional SOCKS5 egress; socks5h resolves target names on the proxy.
# proxy: socks5h://127.0.0.1:1080
"#
    }
}
