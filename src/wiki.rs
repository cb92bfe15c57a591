//! Wiki bindings and the bidirectional URL mapper.
//!
//! Forward direction rewrites wiki-origin URLs inside upstream responses to
//! proxy-origin URLs; the reverse direction maps a request path at the proxy
//! back to an upstream `(domain, path)` pair. All per-binding state is
//! compiled once at load time and immutable afterwards.

use std::borrow::Cow;
use std::collections::HashMap;

use regex::bytes::{Captures, Regex};

use crate::config::{ConfigError, WikiConfig};

/// Per-request rewrite context: the client-facing host and the optional
/// `":NNN"` port suffix seen on the client's Host header.
#[derive(Debug, Clone, Copy)]
pub struct RewriteCtx<'a> {
    pub proxy_host: &'a str,
    pub hport: &'a str,
}

struct PrefixMap {
    domain: String,
    /// Configured prefix minus the trailing slash; empty means "strip
    /// nothing" (the primary-domain entry).
    prefix: String,
}

pub struct WikiBinding {
    host: String,
    domain: String,
    prefixes: Vec<PrefixMap>,
    replacements: HashMap<Vec<u8>, Vec<u8>>,
    pattern: Regex,
}

impl WikiBinding {
    /// Precompute the regex, replacement table, and ordered prefix list for
    /// one binding.
    pub fn compile(config: &WikiConfig) -> Result<WikiBinding, ConfigError> {
        let mut domains = vec![config.domain.clone()];
        let mut replacements = HashMap::new();
        replacements.insert(config.domain.clone().into_bytes(), Vec::new());

        let mut prefixes = Vec::with_capacity(config.maps.len());
        for (domain, prefix) in &config.maps {
            let stripped = prefix.trim_end_matches('/');
            prefixes.push(PrefixMap {
                domain: domain.clone(),
                prefix: stripped.to_string(),
            });
            if !domains.contains(domain) {
                domains.push(domain.clone());
            }
            replacements.insert(domain.clone().into_bytes(), stripped.as_bytes().to_vec());
        }

        let alternation = domains
            .iter()
            .map(|d| regex::escape(d))
            .collect::<Vec<_>>()
            .join("|");
        // The trailing group captures the boundary character so it can be
        // copied into the replacement verbatim. Unicode mode is off so the
        // boundary class matches any byte, valid UTF-8 or not.
        let pattern = format!("(?-u)(https?:)?//({})($|\\s|[^a-zA-Z0-9_.])", alternation);
        let pattern = Regex::new(&pattern).map_err(|err| {
            ConfigError::Invalid(format!("cannot compile domain pattern for {:?}: {}", config.host, err))
        })?;

        Ok(WikiBinding {
            host: config.host.clone(),
            domain: config.domain.clone(),
            prefixes,
            replacements,
            pattern,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Forward mapping: swap every wiki-domain URL for its proxy form,
    /// preserving the original scheme and the boundary character.
    pub fn rewrite_bytes<'a>(&self, text: &'a [u8], ctx: &RewriteCtx<'_>) -> Cow<'a, [u8]> {
        self.pattern.replace_all(text, |caps: &Captures| {
            let mut out = Vec::new();
            if let Some(scheme) = caps.get(1) {
                out.extend_from_slice(scheme.as_bytes());
            }
            out.extend_from_slice(b"//");
            out.extend_from_slice(ctx.proxy_host.as_bytes());
            out.extend_from_slice(ctx.hport.as_bytes());
            if let Some(domain) = caps.get(2) {
                if let Some(prefix) = self.replacements.get(domain.as_bytes()) {
                    out.extend_from_slice(prefix);
                }
            }
            if let Some(boundary) = caps.get(3) {
                out.extend_from_slice(boundary.as_bytes());
            }
            out
        })
    }

    /// Forward mapping over text, for headers and tests.
    pub fn rewrite_text<'a>(&self, text: &'a str, ctx: &RewriteCtx<'_>) -> Cow<'a, str> {
        match self.rewrite_bytes(text.as_bytes(), ctx) {
            Cow::Borrowed(_) => Cow::Borrowed(text),
            Cow::Owned(bytes) => Cow::Owned(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }

    /// Reverse mapping: request path at the proxy to upstream
    /// `(wiki_domain, path)`. Prefixes are tested in configuration order;
    /// unmatched paths belong to the primary domain unchanged.
    pub fn resolve_path<'a>(&'a self, path: &str) -> (&'a str, String) {
        for map in &self.prefixes {
            if path == map.prefix || (path.len() == map.prefix.len() + 1
                && path.starts_with(&map.prefix)
                && path.ends_with('/'))
            {
                return (&map.domain, "/".to_string());
            }
            if path.len() > map.prefix.len() + 1 && path.starts_with(&map.prefix)
                && path.as_bytes()[map.prefix.len()] == b'/'
            {
                // Strip the prefix, keeping the slash that follows it.
                return (&map.domain, path[map.prefix.len()..].to_string());
            }
        }
        (&self.domain, path.to_string())
    }
}

/// All compiled bindings, addressable by client-facing host.
pub struct Bindings {
    list: Vec<WikiBinding>,
    by_host: HashMap<String, usize>,
}

impl Bindings {
    pub fn compile(configs: &[WikiConfig]) -> Result<Bindings, ConfigError> {
        let mut list = Vec::with_capacity(configs.len());
        let mut by_host = HashMap::new();
        for config in configs {
            let binding = WikiBinding::compile(config)?;
            by_host.insert(binding.host.to_ascii_lowercase(), list.len());
            list.push(binding);
        }
        Ok(Bindings { list, by_host })
    }

    pub fn by_host(&self, host: &str) -> Option<&WikiBinding> {
        self.by_host
            .get(&host.to_ascii_lowercase())
            .map(|&i| &self.list[i])
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// Split a verbatim Host header into the bare host and the `":NNN"` suffix
/// (empty when no port is present).
pub fn split_hport(host: &str) -> (&str, &str) {
    if let Some(end) = host.strip_prefix('[').and_then(|_| host.find(']')) {
        let (bare, rest) = host.split_at(end + 1);
        if rest.starts_with(':') {
            return (bare, rest);
        }
        return (host, "");
    }
    match host.rsplit_once(':') {
        Some((bare, port))
            if !bare.contains(':') && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            (bare, &host[bare.len()..])
        }
        _ => (host, ""),
    }
}
