//! Named advisory locks with fencing tokens.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;

/// Default lock expiry. Holders must not assume exclusion beyond it.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The key is currently held by someone else.
    #[error("lock on {0:?} is held, acquire later")]
    AcquireLater(String),

    /// The key is not held by the presented token.
    #[error("lock on {key:?} is not held by token {token:?}")]
    NotFound { key: String, token: String },

    /// The backing store could not be reached.
    #[error("lock backend: {0}")]
    Backend(String),
}

impl LockError {
    /// Whether the caller should retry later (the busy case).
    pub fn is_acquire_later(&self) -> bool {
        matches!(self, Self::AcquireLater(_))
    }
}

/// Named exclusive locks.
///
/// `acquire` returns a fresh fencing token the holder must present to
/// `release`. Locks expire after the TTL; they are advisory.
#[async_trait]
pub trait Locker: Send + Sync {
    async fn acquire(&self, key: &str) -> Result<String, LockError>;
    async fn release(&self, key: &str, token: &str) -> Result<(), LockError>;
}

/// Generate a fencing token.
pub(crate) fn fencing_token() -> String {
    let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..16)
        .map(|_| chars[rng.random_range(0..chars.len())] as char)
        .collect()
}

struct Held {
    token: String,
    expires_at: Instant,
}

/// In-process locker. Expired entries are treated as absent, mirroring the
/// remote locker's TTL behaviour.
pub struct MemoryLocker {
    held: Mutex<HashMap<String, Held>>,
    ttl: Duration,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_LOCK_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            ttl,
        }
    }
}

impl Default for MemoryLocker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn acquire(&self, key: &str) -> Result<String, LockError> {
        let mut held = self.held.lock().expect("lock table poisoned");
        let now = Instant::now();
        if let Some(entry) = held.get(key) {
            if entry.expires_at > now {
                return Err(LockError::AcquireLater(key.to_string()));
            }
        }
        let token = fencing_token();
        held.insert(
            key.to_string(),
            Held {
                token: token.clone(),
                expires_at: now + self.ttl,
            },
        );
        Ok(token)
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        let mut held = self.held.lock().expect("lock table poisoned");
        match held.get(key) {
            Some(entry) if entry.token == token => {
                held.remove(key);
                Ok(())
            }
            _ => Err(LockError::NotFound {
                key: key.to_string(),
                token: token.to_string(),
            }),
        }
    }
}
