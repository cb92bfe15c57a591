//! Keepalive pool for upstream connections.
//!
//! Idle sockets are interchangeable only within one pool key; a checked-out
//! socket is exclusively owned by its request until returned or dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::io::BufReader;

use crate::net::stream::ClientStream;

/// Connections are reusable iff every part of the key matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub sni: String,
}

/// The pooled unit keeps its read buffer so no response bytes are lost
/// between requests.
pub type PooledIo = BufReader<ClientStream>;

struct Idle {
    io: PooledIo,
    expires_at: Instant,
}

pub struct ConnectionPool {
    idle: Mutex<HashMap<PoolKey, Vec<Idle>>>,
    max_idle_per_key: usize,
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(max_idle_per_key: usize, idle_timeout: Duration) -> Self {
        ConnectionPool {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_key: max_idle_per_key.max(1),
            idle_timeout,
        }
    }

    /// Most-recently returned idle socket for `key`, if any is still fresh.
    /// Expired sockets found on the way are dropped.
    pub fn checkout(&self, key: &PoolKey) -> Option<PooledIo> {
        let mut idle = self.idle.lock().expect("pool lock");
        let bucket = idle.get_mut(key)?;
        let now = Instant::now();
        while let Some(candidate) = bucket.pop() {
            if candidate.expires_at > now {
                return Some(candidate.io);
            }
        }
        None
    }

    /// Return a socket after clean request completion. The oldest idle
    /// socket is dropped when the bucket is full.
    pub fn checkin(&self, key: PoolKey, io: PooledIo) {
        let mut idle = self.idle.lock().expect("pool lock");
        let bucket = idle.entry(key).or_default();
        if bucket.len() >= self.max_idle_per_key {
            bucket.remove(0);
        }
        bucket.push(Idle {
            io,
            expires_at: Instant::now() + self.idle_timeout,
        });
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        // Matches typical upstream keepalive windows.
        ConnectionPool::new(8, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    fn key(host: &str, port: u16) -> PoolKey {
        PoolKey {
            scheme: "http".into(),
            host: host.into(),
            port,
            tls: false,
            sni: host.into(),
        }
    }

    async fn io_pair() -> PooledIo {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let _server = listener.accept().await.unwrap();
        BufReader::new(ClientStream::Plain(client))
    }

    #[tokio::test]
    async fn checkout_empty_is_none() {
        let pool = ConnectionPool::default();
        assert!(pool.checkout(&key("en.wikipedia.org", 443)).is_none());
    }

    #[tokio::test]
    async fn checkin_then_checkout() {
        let pool = ConnectionPool::default();
        let k = key("en.wikipedia.org", 443);
        pool.checkin(k.clone(), io_pair().await);
        assert!(pool.checkout(&k).is_some());
        assert!(pool.checkout(&k).is_none());
    }

    #[tokio::test]
    async fn keys_do_not_share_sockets() {
        let pool = ConnectionPool::default();
        pool.checkin(key("en.wikipedia.org", 443), io_pair().await);
        assert!(pool.checkout(&key("de.wikipedia.org", 443)).is_none());

        let mut sni_differs = key("en.wikipedia.org", 443);
        sni_differs.sni = "other.example".into();
        assert!(pool.checkout(&sni_differs).is_none());
    }

    #[tokio::test]
    async fn expired_sockets_are_dropped() {
        let pool = ConnectionPool::new(4, Duration::from_millis(10));
        let k = key("en.wikipedia.org", 443);
        pool.checkin(k.clone(), io_pair().await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(pool.checkout(&k).is_none());
    }

    #[tokio::test]
    async fn bucket_depth_is_bounded() {
        let pool = ConnectionPool::new(2, Duration::from_secs(60));
        let k = key("en.wikipedia.org", 443);
        for _ in 0..3 {
            pool.checkin(k.clone(), io_pair().await);
        }
        assert!(pool.checkout(&k).is_some());
        assert!(pool.checkout(&k).is_some());
        assert!(pool.checkout(&k).is_none());
    }
}
