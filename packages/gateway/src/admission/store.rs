// ABOUTME: Keyed windowed counter storage used by admission control and the usage ledger
// ABOUTME: Defines the CounterStore trait and the default in-process implementation

use crate::clock::to_chrono;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Counter {key} holds an invalid value: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Current value of a counter and when it resets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub expires_at: DateTime<Utc>,
}

impl WindowCount {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Atomic increment-with-expiry over string keys
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `amount` to `key`. A missing or expired key restarts at `amount` and
    /// expires `ttl` after `now`; a live key keeps its original expiry.
    async fn increment(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount>;

    /// Read a counter without changing it; expired keys read as absent
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<WindowCount>>;

    /// Drop expired keys, returning how many were removed
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, WindowCount>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = counters
            .entry(key.to_string())
            .and_modify(|current| {
                if current.is_expired(now) {
                    *current = WindowCount {
                        count: amount,
                        expires_at: now + to_chrono(ttl),
                    };
                } else {
                    current.count = current.count.saturating_add(amount);
                }
            })
            .or_insert_with(|| WindowCount {
                count: amount,
                expires_at: now + to_chrono(ttl),
            });
        Ok(*entry)
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<WindowCount>> {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(counters.get(key).filter(|c| !c.is_expired(now)).copied())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let before = counters.len();
        counters.retain(|_, c| !c.is_expired(now));
        Ok((before - counters.len()) as u64)
    }
}
