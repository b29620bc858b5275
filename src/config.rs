use std::time::Duration;

use serde::Deserialize;

/// Immutable configuration for the idempotency core, constructed once at
/// startup and handed to the context. No global mutable state, no reload.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name of the idempotency-key header.
    pub header: String,
    /// Methods with read-only semantics, exempt from idempotency handling.
    pub safe_methods: Vec<String>,
    pub storage: StorageSettings,
    pub lock: LockSettings,
    /// Status code for missing-key and key-reuse rejections.
    pub bad_response_status: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Redis connection URL; ignored by the memory backend.
    pub url: String,
    /// How long a cached response is kept.
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub backend: LockBackend,
    /// Redis connection URL; ignored by the local backend.
    pub url: String,
    /// Lease after which a crashed holder's lock is force-released.
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    Local,
    Redis,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header: "Idempotency-Key".to_string(),
            safe_methods: ["GET", "HEAD", "OPTIONS", "TRACE"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            storage: StorageSettings::default(),
            lock: LockSettings::default(),
            bad_response_status: 400,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            url: "redis://localhost:6379/0".to_string(),
            ttl_seconds: 600,
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            backend: LockBackend::Local,
            url: "redis://localhost:6379/0".to_string(),
            ttl_seconds: 300,
        }
    }
}

impl Settings {
    /// Loads settings from `config/idempotency.*` (if present) with
    /// `IDEMPOTENCY__`-prefixed environment overrides.
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("config/idempotency").required(false))
            .add_source(config::Environment::with_prefix("IDEMPOTENCY").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn is_safe_method(&self, method: &str) -> bool {
        self.safe_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }

    pub fn storage_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.ttl_seconds)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock.ttl_seconds)
    }
}
