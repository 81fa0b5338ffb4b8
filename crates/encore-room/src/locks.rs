//! Per-user critical sections.
//!
//! Every registry and coordinator operation touching a user runs while
//! holding that user's lock, so two devices of one user can't race each
//! other through a leave cascade. Different users never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use encore_protocol::UserId;
use tokio::sync::Mutex as AsyncMutex;

use crate::RoomError;

/// Proof that a user's lock is held. Dropping it releases the lock.
pub struct UserGuard {
    _held: Box<dyn Send + Sync>,
}

impl UserGuard {
    /// Wraps whatever keeps the lock held until dropped.
    pub fn new(held: impl Send + Sync + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl std::fmt::Debug for UserGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserGuard").finish_non_exhaustive()
    }
}

/// Serializes operations per user.
#[async_trait]
pub trait UserLock: Send + Sync {
    /// Waits up to `timeout` for `user`'s lock.
    async fn acquire(&self, user: UserId, timeout: Duration) -> Result<UserGuard, RoomError>;
}

// ---------------------------------------------------------------------------
// InMemoryUserLock
// ---------------------------------------------------------------------------

/// Single-process lock: one `tokio::sync::Mutex` per user.
///
/// Entries are created on first use and dropped once nobody holds or
/// waits on them.
#[derive(Clone, Default)]
pub struct InMemoryUserLock {
    locks: Arc<Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>>,
}

impl InMemoryUserLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of users with a live lock entry.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, Arc<AsyncMutex<()>>>> {
        match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Releases the mutex, then prunes the map entry if unused.
struct LocalHold {
    user: UserId,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
    owner: InMemoryUserLock,
}

impl Drop for LocalHold {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.owner.map();
        // Only the map holds the Arc: nobody is waiting.
        if map
            .get(&self.user)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            map.remove(&self.user);
        }
    }
}

#[async_trait]
impl UserLock for InMemoryUserLock {
    async fn acquire(&self, user: UserId, timeout: Duration) -> Result<UserGuard, RoomError> {
        let mutex = self.map().entry(user).or_default().clone();
        let guard = tokio::time::timeout(timeout, mutex.lock_owned())
            .await
            .map_err(|_| RoomError::Lock(format!("timed out waiting for {user}")))?;
        Ok(UserGuard::new(LocalHold {
            user,
            guard: Some(guard),
            owner: self.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// RedisUserLock
// ---------------------------------------------------------------------------

#[cfg(feature = "redis")]
pub use redis_lock::RedisUserLock;

#[cfg(feature = "redis")]
mod redis_lock {
    use std::time::Duration;

    use async_trait::async_trait;
    use encore_protocol::UserId;
    use rand::Rng;
    use redis::aio::MultiplexedConnection;
    use redis::{Client, Script};
    use tokio::time::Instant;

    use super::{UserGuard, UserLock};
    use crate::RoomError;

    /// Deletes the key only if it still holds our token.
    const RELEASE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

    /// Delay between acquisition attempts.
    const POLL_INTERVAL: Duration = Duration::from_millis(25);

    fn lock_key(user: UserId) -> String {
        format!("encore:lock:user:{}", user.as_uuid())
    }

    /// Multi-process lock: `SET key token NX PX ttl`, released with a
    /// compare-and-delete script.
    ///
    /// The TTL bounds how long a crashed holder blocks the user.
    #[derive(Clone)]
    pub struct RedisUserLock {
        connection: MultiplexedConnection,
        ttl: Duration,
        release: Script,
    }

    impl RedisUserLock {
        pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self, RoomError> {
            let client = Client::open(redis_url).map_err(|e| {
                tracing::error!(error = %e, "failed to open Redis client for locks");
                RoomError::Lock(e.to_string())
            })?;
            let connection = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "failed to connect to Redis for locks");
                    RoomError::Lock(e.to_string())
                })?;
            Ok(Self {
                connection,
                ttl,
                release: Script::new(RELEASE),
            })
        }

        async fn try_acquire(&self, key: &str, token: &str) -> Result<bool, RoomError> {
            let mut conn = self.connection.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(token)
                .arg("NX")
                .arg("PX")
                .arg(u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX))
                .query_async(&mut conn)
                .await
                .map_err(|e| RoomError::Lock(e.to_string()))?;
            Ok(reply.is_some())
        }
    }

    /// Runs the release script when dropped.
    struct RedisHold {
        key: String,
        token: String,
        connection: MultiplexedConnection,
        release: Script,
    }

    impl Drop for RedisHold {
        fn drop(&mut self) {
            let key = std::mem::take(&mut self.key);
            let token = std::mem::take(&mut self.token);
            let mut conn = self.connection.clone();
            let release = self.release.clone();
            // Drop can't await; if no runtime is left the TTL expires it.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let result: Result<i64, _> =
                        release.key(&key).arg(&token).invoke_async(&mut conn).await;
                    if let Err(e) = result {
                        tracing::warn!(error = %e, %key, "failed to release user lock");
                    }
                });
            }
        }
    }

    #[async_trait]
    impl UserLock for RedisUserLock {
        async fn acquire(&self, user: UserId, timeout: Duration) -> Result<UserGuard, RoomError> {
            let key = lock_key(user);
            let token = format!("{:032x}", rand::rng().random::<u128>());
            let deadline = Instant::now() + timeout;

            loop {
                if self.try_acquire(&key, &token).await? {
                    return Ok(UserGuard::new(RedisHold {
                        key,
                        token,
                        connection: self.connection.clone(),
                        release: self.release.clone(),
                    }));
                }
                if Instant::now() >= deadline {
                    return Err(RoomError::Lock(format!("timed out waiting for {user}")));
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_waits_for_release() {
        let locks = InMemoryUserLock::new();
        let user = UserId::new();

        let guard = locks.acquire(user, Duration::from_secs(1)).await.unwrap();
        let err = locks
            .acquire(user, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Lock(_)));

        drop(guard);
        assert!(locks.acquire(user, Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_different_users_do_not_contend() {
        let locks = InMemoryUserLock::new();
        let _a = locks.acquire(UserId::new(), Duration::from_secs(1)).await.unwrap();
        let _b = locks
            .acquire(UserId::new(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_released_entries_are_pruned() {
        let locks = InMemoryUserLock::new();
        let guard = locks.acquire(UserId::new(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(locks.len(), 1);
        drop(guard);
        assert!(locks.is_empty());
    }
}
