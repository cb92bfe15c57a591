//! Challenge-based admission gate.
//!
//! Each `(client_ip, user_agent)` pair must repeat its request until the
//! challenge counter passes the configured retry budget; admission is then
//! remembered for a TTL. Counter and admission live under disjoint keys in
//! one shared TTL map.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::AuthConfig;

/// Shared TTL-keyed counter map. `incr` is atomic across concurrent callers
/// of the same key; expiry is applied lazily on access.
pub struct TtlMap {
    inner: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    value: u64,
    expires_at: Instant,
}

impl TtlMap {
    pub fn new() -> Self {
        TtlMap {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        let mut map = self.inner.lock().expect("ttl map lock");
        match map.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: u64, ttl: Duration) {
        let mut map = self.inner.lock().expect("ttl map lock");
        Self::purge_expired(&mut map);
        map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Increment `key`, initializing an absent or expired entry to `init`
    /// with lifetime `ttl` first. The TTL is not refreshed on later
    /// increments. Returns the post-increment value.
    pub fn incr(&self, key: &str, init: u64, ttl: Duration) -> u64 {
        let mut map = self.inner.lock().expect("ttl map lock");
        Self::purge_expired(&mut map);
        let now = Instant::now();
        let entry = map.entry(key.to_string()).or_insert(Entry {
            value: init,
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.value = init;
            entry.expires_at = now + ttl;
        }
        entry.value += 1;
        entry.value
    }

    fn purge_expired(map: &mut HashMap<String, Entry>) {
        // Amortized cleanup; the map otherwise only sheds keys on point reads.
        if map.len() >= 1024 {
            let now = Instant::now();
            map.retain(|_, entry| entry.expires_at > now);
        }
    }
}

impl Default for TtlMap {
    fn default() -> Self {
        TtlMap::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Proceed to proxying.
    Granted,
    /// Reply with the challenge status; the body is the remaining count the
    /// client sees.
    Challenge { status: u16, body: String },
    /// Empty `User-Agent`: reply 400 and stop.
    MissingUserAgent,
}

pub struct AdmissionGate {
    map: TtlMap,
    status: u16,
    retries: u64,
    wait_time: Duration,
    ttl: Duration,
}

impl AdmissionGate {
    pub fn new(config: &AuthConfig) -> Self {
        AdmissionGate {
            map: TtlMap::new(),
            status: config.code,
            retries: config.retries,
            wait_time: Duration::from_secs(config.wait_time_s),
            ttl: Duration::from_secs(config.ttl_s),
        }
    }

    #[cfg(test)]
    fn with_timing(status: u16, retries: u64, wait_time: Duration, ttl: Duration) -> Self {
        AdmissionGate {
            map: TtlMap::new(),
            status,
            retries,
            wait_time,
            ttl,
        }
    }

    pub fn check(&self, ip: IpAddr, user_agent: &str) -> Admission {
        if user_agent.is_empty() {
            return Admission::MissingUserAgent;
        }

        let authed_key = format!("authed:{}:{}", ip, user_agent);
        if self.map.get(&authed_key).is_some() {
            return Admission::Granted;
        }

        let authing_key = format!("authing:{}:{}", ip, user_agent);
        let count = self.map.incr(&authing_key, 0, self.wait_time);
        if count <= self.retries {
            return Admission::Challenge {
                status: self.status,
                body: (self.retries + 1 - count).to_string(),
            };
        }

        self.map.set(&authed_key, 1, self.ttl);
        tracing::debug!("admitted {} after {} attempts", ip, count);
        Admission::Granted
    }
}
