use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// A held lock. Dropping the guard releases the lock, so every exit path of
/// the critical section (stored, replayed, conflict, handler error, panic)
/// releases it.
pub struct LockGuard {
    _held: Box<dyn std::any::Any + Send>,
}

/// Named mutual exclusion for the lookup-through-write critical section.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Acquires the named lock, blocking until granted. There is no
    /// acquisition timeout: a caller wanting a bounded wait cancels by
    /// dropping the future, which abandons the wait without holding anything.
    async fn acquire(&self, name: &str) -> Result<LockGuard>;
}

/// Process-local mutual exclusion keyed by lock name.
///
/// Only correct when a single process owns the result store. Development and
/// test mode; multi-process deployments use [`RedisLocker`].
#[derive(Default)]
pub struct LocalLocker {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Locker for LocalLocker {
    async fn acquire(&self, name: &str) -> Result<LockGuard> {
        let entry = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = entry.lock_owned().await;
        Ok(LockGuard {
            _held: Box::new(guard),
        })
    }
}

/// Distributed mutual exclusion backed by Redis `SET NX PX`.
///
/// The lease force-releases the lock if the holder crashes or stalls, trading
/// permanent deadlock for a narrow window where two holders can overlap after
/// an expiry. Release is a compare-and-delete on a per-acquisition token, so
/// a holder that outlived its lease cannot delete its successor's lock.
pub struct RedisLocker {
    client: redis::Client,
    lease: Duration,
}

impl RedisLocker {
    pub fn new(client: redis::Client, lease: Duration) -> Self {
        Self { client, lease }
    }
}

#[async_trait]
impl Locker for RedisLocker {
    async fn acquire(&self, name: &str) -> Result<LockGuard> {
        use redis::AsyncCommands;

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let token = uuid::Uuid::new_v4().to_string();

        loop {
            let granted: Option<String> = conn
                .set_options(
                    name,
                    &token,
                    redis::SetOptions::default()
                        .conditional_set(redis::ExistenceCheck::NX)
                        .with_expiration(redis::SetExpiry::PX(self.lease.as_millis() as usize)),
                )
                .await?;
            if granted.is_some() {
                break;
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }

        Ok(LockGuard {
            _held: Box::new(RedisLease {
                client: self.client.clone(),
                name: name.to_string(),
                token,
            }),
        })
    }
}

struct RedisLease {
    client: redis::Client,
    name: String,
    token: String,
}

impl Drop for RedisLease {
    fn drop(&mut self) {
        let client = self.client.clone();
        let name = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);

        // Release runs off the drop path. If the spawned task never runs, the
        // lease expiry reclaims the lock.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let released: std::result::Result<i32, redis::RedisError> = async {
                    let mut conn = client.get_multiplexed_async_connection().await?;
                    redis::Script::new(RELEASE_SCRIPT)
                        .key(&name)
                        .arg(&token)
                        .invoke_async(&mut conn)
                        .await
                }
                .await;
                if let Err(e) = released {
                    tracing::warn!("failed to release lock {}: {}", name, e);
                }
            });
        }
    }
}
