//! Counter store abstraction.
//!
//! The store is the only synchronization point between server processes:
//! every implementation must create-and-increment a key atomically so that
//! concurrent first touches neither double-initialize the counter nor re-arm
//! its expiry.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors raised by counter store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or answered with an error.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the allotted time.
    #[error("store operation timed out")]
    Timeout,
}

/// Shared, network-accessible counter with expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Create `key` with count 0 and expiry `window` if absent, then
    /// increment it by one. Returns the post-increment value.
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<i64, StoreError>;

    /// Time left before `key` expires, or `None` when the key is absent or
    /// has no expiry.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Same create-if-absent pattern as
    /// [`increment_with_expiry`](Self::increment_with_expiry), but decrements.
    /// Only used to refund a previous increment.
    async fn decrement(&self, key: &str, window: Duration) -> Result<i64, StoreError>;
}
