//! Name resolution with an LRU+TTL answer cache.
//!
//! Textual addresses short-circuit without touching the network. Real
//! lookups try the A/AAAA families in configured preference order and stop
//! at the first family that yields answers. Every query builds a fresh
//! underlying resolver; sharing one across concurrent requests corrupts its
//! in-flight state.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv6Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use rand::Rng;

use crate::config::DnsConfig;
use crate::net::addr;

#[derive(thiserror::Error, Debug)]
pub enum DnsError {
    #[error("no address records for {0:?}")]
    NoAddress(String),
}

/// Uniform random pick from a non-empty answer list.
pub fn pick(addrs: &[String]) -> &str {
    let i = rand::thread_rng().gen_range(0..addrs.len());
    addrs[i].as_str()
}

pub struct Resolver {
    config: DnsConfig,
    cache: Mutex<AnswerCache>,
}

impl Resolver {
    pub fn new(config: DnsConfig) -> Self {
        let cache = AnswerCache::new(
            config.cache.size,
            Duration::from_secs(config.cache.ttl_s),
        );
        Resolver {
            config,
            cache: Mutex::new(cache),
        }
    }

    /// Resolve `name` to a list of address strings, IPv6 bracketed.
    pub async fn resolve(&self, name: &str) -> Result<Vec<String>, DnsError> {
        if addr::is_ipv4(name) {
            return Ok(vec![name.to_string()]);
        }
        if let Some(inner) = addr::is_ipv6(name, true) {
            return Ok(vec![format!("[{}]", canonical_ipv6(inner))]);
        }

        let name = name.to_ascii_lowercase();
        if let Some(hit) = self.cache.lock().expect("dns cache lock").get(&name) {
            return Ok(hit);
        }

        let families = if self.config.prefer_ipv6 {
            [RecordType::AAAA, RecordType::A]
        } else {
            [RecordType::A, RecordType::AAAA]
        };

        for family in families {
            // Never reuse a resolver across queries.
            let resolver = self.fresh_resolver();
            let lookup = match resolver.lookup(name.as_str(), family).await {
                Ok(lookup) => lookup,
                Err(err) => {
                    tracing::debug!("dns {} lookup for {} failed: {}", family, name, err);
                    continue;
                }
            };

            let addrs: Vec<String> = lookup
                .iter()
                .filter_map(|record| match (family, record) {
                    (RecordType::A, RData::A(v4)) => Some(v4.0.to_string()),
                    (RecordType::AAAA, RData::AAAA(v6)) => Some(format!("[{}]", v6.0)),
                    // Answers of a type we did not ask for are dropped.
                    _ => None,
                })
                .collect();

            if !addrs.is_empty() {
                self.cache
                    .lock()
                    .expect("dns cache lock")
                    .insert(name, addrs.clone());
                return Ok(addrs);
            }
        }

        Err(DnsError::NoAddress(name))
    }

    fn fresh_resolver(&self) -> TokioAsyncResolver {
        let group = NameServerConfigGroup::from_ips_clear(&self.config.nameservers, 53, true);
        let resolver_config = ResolverConfig::from_parts(None, vec![], group);

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(self.config.timeout_s);
        opts.attempts = self.config.retrans;
        opts.use_hosts_file = false;

        TokioAsyncResolver::tokio(resolver_config, opts)
    }

    #[cfg(test)]
    fn seed(&self, name: &str, addrs: Vec<String>) {
        self.cache
            .lock()
            .expect("dns cache lock")
            .insert(name.to_string(), addrs);
    }
}

fn canonical_ipv6(inner: &str) -> String {
    let (address, zone) = match inner.split_once('%') {
        Some((address, zone)) => (address, Some(zone)),
        None => (inner, None),
    };
    let canonical = address
        .parse::<Ipv6Addr>()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| address.to_string());
    match zone {
        Some(zone) => format!("{}%{}", canonical, zone),
        None => canonical,
    }
}

/// Fixed-capacity LRU with one TTL per entry. Writers on a racing cache miss
/// overwrite each other's entry; that duplicate work is accepted.
struct AnswerCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    capacity: usize,
    ttl: Duration,
}

struct CacheEntry {
    addrs: Vec<String>,
    expires_at: Instant,
}

impl AnswerCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        AnswerCache {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    fn get(&mut self, name: &str) -> Option<Vec<String>> {
        match self.entries.get(name) {
            Some(entry) if entry.expires_at > Instant::now() => {
                let addrs = entry.addrs.clone();
                self.touch(name);
                Some(addrs)
            }
            Some(_) => {
                self.entries.remove(name);
                self.order.retain(|k| k != name);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, name: String, addrs: Vec<String>) {
        let expires_at = Instant::now() + self.ttl;
        if self.entries.insert(name.clone(), CacheEntry { addrs, expires_at }).is_none() {
            self.order.push_back(name);
        } else {
            self.touch(&name);
        }
        self.evict();
    }

    fn touch(&mut self, name: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == name) {
            self.order.remove(pos);
        }
        self.order.push_back(name.to_string());
    }

    fn evict(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.order.retain(|k| self.entries.contains_key(k));
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }
}
