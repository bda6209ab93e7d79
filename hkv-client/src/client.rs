//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API for issuing Redis-compatible
//! commands to the HybridKV server over RESP2, transparently following
//! `-MOVED` redirects across a cluster.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling and protocol details.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Fail Fast**: Protocol violations surface immediately as errors.
//! 4. **Performance First**: Prefer direct TCP writes and buffer reuse.
//! 5. **Slot-Cache, Not Full Topology**: the client never asks for
//!    `CLUSTER SLOTS`; it just remembers, per slot, the last address a
//!    `MOVED` pointed it to, and follows a new redirect when that guess is
//!    stale.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use hkv_common::hash::slot_for_key;

use crate::pool::{ConnectionPool, PoolConfig};
use crate::resp::RespValue;

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the sync client.
#[derive(Debug)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    Io(std::io::Error),
    /// RESP2 framing or parse error.
    Protocol,
    /// Server returned an error reply.
    Server { message: Vec<u8> },
    /// Response type did not match the expected command response.
    UnexpectedResponse,
    /// Pool is at capacity and no idle connections are available.
    PoolExhausted,
    /// Address could not be parsed into a socket address.
    InvalidAddress,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(err) => write!(f, "io error: {}", err),
            ClientError::Protocol => write!(f, "protocol error"),
            ClientError::Server { message } => {
                write!(f, "server error: {}", String::from_utf8_lossy(message))
            }
            ClientError::UnexpectedResponse => write!(f, "unexpected response"),
            ClientError::PoolExhausted => write!(f, "connection pool exhausted"),
            ClientError::InvalidAddress => write!(f, "invalid address"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err)
    }
}

/// TTL state returned by the server, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Configuration for the synchronous client and its pool.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:6379".to_string(),
            max_idle: 8,
            max_total: 16,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
        }
    }
}

/// Synchronous client with connection pooling and cluster-aware redirects.
///
/// This is a facade over the pool and RESP encoder/decoder. Each call
/// resolves a target address (the slot cache, or the configured seed
/// address if nothing is cached yet), acquires a connection from that
/// address's pool, and executes one command. A `-MOVED` reply is followed
/// transparently: the command is retried once against the address the
/// server named, and the slot cache is updated so later calls for the same
/// slot go straight there.
pub struct KVClient {
    base: PoolConfig,
    pools: Mutex<HashMap<String, ConnectionPool>>,
    slot_routes: Mutex<HashMap<u16, String>>,
}

impl KVClient {
    /// Creates a client with default configuration.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        let mut config = ClientConfig::default();
        config.addr = addr.into();
        Self::with_config(config)
    }

    /// Creates a client with a custom configuration. `config.addr` is the
    /// seed node; other nodes discovered via `MOVED` are pooled the same way.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let base = PoolConfig {
            addr: config.addr.clone(),
            max_idle: config.max_idle,
            max_total: config.max_total,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            connect_timeout: config.connect_timeout,
        };
        let mut pools = HashMap::new();
        pools.insert(config.addr.clone(), ConnectionPool::new(base.clone())?);
        Ok(KVClient {
            base,
            pools: Mutex::new(pools),
            slot_routes: Mutex::new(HashMap::new()),
        })
    }

    fn pool_for(&self, addr: &str) -> ClientResult<ConnectionPool> {
        let mut pools = self.pools.lock().expect("client pool map poisoned");
        if let Some(pool) = pools.get(addr) {
            return Ok(pool.clone());
        }
        let pool = ConnectionPool::new(PoolConfig {
            addr: addr.to_string(),
            ..self.base.clone()
        })?;
        pools.insert(addr.to_string(), pool.clone());
        Ok(pool)
    }

    /// The address this client would currently target for `key`: the
    /// cached owner from a previous `MOVED`, or the seed address.
    fn addr_for_key(&self, key: &[u8]) -> (u16, String) {
        let slot = slot_for_key(key);
        let addr = self
            .slot_routes
            .lock()
            .expect("slot route map poisoned")
            .get(&slot)
            .cloned()
            .unwrap_or_else(|| self.base.addr.clone());
        (slot, addr)
    }

    /// Runs `args` against `key`'s current best-known owner, following a
    /// single `-MOVED` redirect if the server disagrees.
    fn exec_for_key(&self, key: &[u8], args: &[&[u8]]) -> ClientResult<RespValue> {
        let (slot, addr) = self.addr_for_key(key);
        let response = self.pool_for(&addr)?.acquire()?.exec(args)?;
        match response {
            RespValue::Error(message) => match parse_moved(&message) {
                Some((_, target)) if target != addr => {
                    self.slot_routes
                        .lock()
                        .expect("slot route map poisoned")
                        .insert(slot, target.clone());
                    self.pool_for(&target)?.acquire()?.exec(args)
                }
                _ => Ok(RespValue::Error(message)),
            },
            other => Ok(other),
        }
    }

    /// Runs `args` against the seed address (used for keyless commands).
    fn exec_seed(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.pool_for(&self.base.addr)?.acquire()?.exec(args)
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        match self.exec_for_key(key, &[b"GET", key])? {
            RespValue::Bulk(data) => Ok(data),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value for a key without expiration.
    pub fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        match self.exec_for_key(key, &[b"SET", key, value])? {
            RespValue::Simple(_) => Ok(()),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value and attaches an expiration in seconds.
    pub fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<()> {
        let (seconds, len) = encode_u64(ttl.as_secs());
        match self.exec_for_key(key, &[b"SET", key, value, b"EX", &seconds[..len]])? {
            RespValue::Simple(_) => Ok(()),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn delete(&self, key: &[u8]) -> ClientResult<bool> {
        match self.exec_for_key(key, &[b"DEL", key])? {
            RespValue::Integer(count) => Ok(count > 0),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> ClientResult<bool> {
        let (seconds, len) = encode_u64(ttl.as_secs());
        match self.exec_for_key(key, &[b"EXPIRE", key, &seconds[..len]])? {
            RespValue::Integer(value) => Ok(value == 1),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Returns TTL status for a key.
    pub fn ttl(&self, key: &[u8]) -> ClientResult<ClientTtl> {
        match self.exec_for_key(key, &[b"TTL", key])? {
            RespValue::Integer(value) if value == -2 => Ok(ClientTtl::Missing),
            RespValue::Integer(value) if value == -1 => Ok(ClientTtl::NoExpiry),
            RespValue::Integer(value) if value >= 0 => {
                Ok(ClientTtl::ExpiresIn(Duration::from_secs(value as u64)))
            }
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Pings the server. Returns the raw response payload.
    pub fn ping(&self, payload: Option<&[u8]>) -> ClientResult<Vec<u8>> {
        let response = match payload {
            Some(data) => self.exec_seed(&[b"PING", data])?,
            None => self.exec_seed(&[b"PING"])?,
        };
        match response {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => Ok(data),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches server INFO output.
    pub fn info(&self) -> ClientResult<Vec<u8>> {
        match self.exec_seed(&[b"INFO"])? {
            RespValue::Bulk(Some(data)) => Ok(data),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}

/// Parses a `MOVED <slot> <host:port>` error body into its parts.
fn parse_moved(message: &[u8]) -> Option<(u16, String)> {
    let text = std::str::from_utf8(message).ok()?;
    let mut parts = text.split_whitespace();
    if parts.next()? != "MOVED" {
        return None;
    }
    let slot: u16 = parts.next()?.parse().ok()?;
    let addr = parts.next()?.to_string();
    Some((slot, addr))
}

fn encode_u64(mut value: u64) -> ([u8; 20], usize) {
    // Stack buffer keeps conversion allocation-free (zero-cost abstraction).
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    while value > 0 {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}
