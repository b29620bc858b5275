use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;

/// Wire format version for stored responses. Bumped whenever the encoding
/// changes shape; readers reject versions they do not understand.
const WIRE_VERSION: u8 = 1;

/// A handler response captured at write time, restorable verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn capture(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Self {
        Self {
            status,
            headers: headers.clone(),
            body: body.to_vec(),
        }
    }
}

/// The unit of state persisted per cache key: the hash of the request body
/// that produced the response, and the response itself. Written exactly once,
/// never updated in place; destroyed only by TTL expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
    pub content_hash: String,
    pub response: StoredResponse,
}

/// Explicit serialization of a cached entry. Header values and the body are
/// hex-encoded bytes so status, headers, and body round-trip exactly; the
/// hash and response live in one document so readers never observe a
/// partially-written record.
#[derive(Serialize, Deserialize)]
struct WireEntry {
    version: u8,
    content_hash: String,
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl CachedEntry {
    pub fn encode(&self) -> Result<String> {
        let wire = WireEntry {
            version: WIRE_VERSION,
            content_hash: self.content_hash.clone(),
            status: self.response.status.as_u16(),
            headers: self
                .response
                .headers
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), hex::encode(value.as_bytes())))
                .collect(),
            body: hex::encode(&self.response.body),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let wire: WireEntry = serde_json::from_str(raw)?;
        if wire.version != WIRE_VERSION {
            return Err(anyhow::anyhow!("unsupported stored response version {}", wire.version).into());
        }

        let status = StatusCode::from_u16(wire.status)
            .map_err(|e| anyhow::anyhow!("invalid stored status code {}: {}", wire.status, e))?;
        let mut headers = HeaderMap::new();
        for (name, value_hex) in &wire.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| anyhow::anyhow!("invalid stored header name {}: {}", name, e))?;
            let value_bytes = hex::decode(value_hex)
                .map_err(|e| anyhow::anyhow!("invalid stored header encoding: {}", e))?;
            let value = HeaderValue::from_bytes(&value_bytes)
                .map_err(|e| anyhow::anyhow!("invalid stored header value: {}", e))?;
            headers.append(name, value);
        }
        let body = hex::decode(&wire.body)
            .map_err(|e| anyhow::anyhow!("invalid stored body encoding: {}", e))?;

        Ok(Self {
            content_hash: wire.content_hash,
            response: StoredResponse {
                status,
                headers,
                body,
            },
        })
    }
}

/// Mapping from cache key to cached entry with TTL expiry. The store is the
/// sole owner of records; the coordinator only reads and writes through this
/// interface, guarded by the lock.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn get(&self, cache_key: &str) -> Result<Option<CachedEntry>>;
    async fn set(&self, cache_key: &str, entry: CachedEntry, ttl: Duration) -> Result<()>;
}

/// In-process store; non-durable, process lifetime only. Expired entries are
/// treated as a miss on the next lookup. Development and test mode.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (CachedEntry, DateTime<Utc>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseStore for MemoryStore {
    async fn get(&self, cache_key: &str) -> Result<Option<CachedEntry>> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(cache_key) {
            Some((_, expires_at)) => *expires_at <= Utc::now(),
            None => return Ok(None),
        };
        if expired {
            entries.remove(cache_key);
            return Ok(None);
        }
        Ok(entries.get(cache_key).map(|(entry, _)| entry.clone()))
    }

    async fn set(&self, cache_key: &str, entry: CachedEntry, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64);
        let mut entries = self.entries.lock().await;
        entries.insert(cache_key.to_string(), (entry, expires_at));
        Ok(())
    }
}

/// Shared external store backed by Redis, durable across processes. Entries
/// are written with `SET .. EX`, so Redis owns the expiry.
pub struct RedisStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn make_key(&self, cache_key: &str) -> String {
        format!("{}:{}", self.key_prefix, cache_key)
    }
}

#[async_trait]
impl ResponseStore for RedisStore {
    async fn get(&self, cache_key: &str) -> Result<Option<CachedEntry>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(self.make_key(cache_key)).await?;
        match raw {
            Some(raw) => Ok(Some(CachedEntry::decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, cache_key: &str, entry: CachedEntry, ttl: Duration) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn
            .set_ex(self.make_key(cache_key), entry.encode()?, ttl.as_secs())
            .await?;
        Ok(())
    }
}
