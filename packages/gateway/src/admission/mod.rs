// ABOUTME: Tiered multi-window admission control (burst, hourly, daily) backed by a counter store
// ABOUTME: Consults the abuse block list first, then increments each window in order until one rejects

pub mod blocklist;
pub mod ledger;
pub mod sqlite;
pub mod store;

pub use blocklist::{BlockEntry, BlockList};
pub use ledger::{LedgerEntry, UsageLedger};
pub use sqlite::SqliteCounterStore;
pub use store::{CounterStore, MemoryCounterStore, StoreError, WindowCount};

use crate::clock::{until, SharedClock};
use crate::settings::{TierLimits, TierTable};
use crate::types::{LimitType, Tier};
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const BURST_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Burst,
    Hourly,
    Daily,
}

impl Window {
    /// Evaluation order; the first window to reject wins
    pub const ORDER: [Window; 3] = [Window::Burst, Window::Hourly, Window::Daily];

    pub fn limit_type(self) -> LimitType {
        match self {
            Window::Burst => LimitType::Burst,
            Window::Hourly => LimitType::Hourly,
            Window::Daily => LimitType::Daily,
        }
    }

    pub fn limit(self, limits: &TierLimits) -> u64 {
        match self {
            Window::Burst => limits.burst,
            Window::Hourly => limits.hourly,
            Window::Daily => limits.daily,
        }
    }

    /// `{identity}:{window}:{periodBucket}`
    pub fn key(self, identity: &str, now: DateTime<Utc>) -> String {
        match self {
            Window::Burst => format!("{}:burst:{}s", identity, BURST_WINDOW.as_secs()),
            Window::Hourly => format!("{}:hourly:{}", identity, now.format("%Y%m%d%H")),
            Window::Daily => format!("{}:daily:{}", identity, now.format("%Y%m%d")),
        }
    }

    /// Lifetime of a key created at `now`; calendar windows end at their bucket boundary
    pub fn ttl(self, now: DateTime<Utc>) -> Duration {
        match self {
            Window::Burst => BURST_WINDOW,
            Window::Hourly => {
                let hour_start = now
                    .date_naive()
                    .and_time(NaiveTime::MIN)
                    .and_utc()
                    + ChronoDuration::hours(i64::from(now.hour()));
                until(hour_start + ChronoDuration::hours(1), now)
            }
            Window::Daily => {
                let day_start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
                until(day_start + ChronoDuration::days(1), now)
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{limit_type} limit exceeded, retry after {retry_after:?}")]
pub struct RateLimitExceeded {
    pub limit_type: LimitType,
    pub retry_after: Duration,
}

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error(transparent)]
    Limited(#[from] RateLimitExceeded),

    #[error("Counter store failure: {0}")]
    Store(#[from] StoreError),
}

pub struct AdmissionController {
    store: Arc<dyn CounterStore>,
    tiers: TierTable,
    blocklist: BlockList,
    clock: SharedClock,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn CounterStore>,
        tiers: TierTable,
        blocklist: BlockList,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            tiers,
            blocklist,
            clock,
        }
    }

    /// Count this request against every window of `tier`.
    ///
    /// Counters are never refunded: a request later rejected by the validator
    /// still consumed its slot.
    pub async fn admit(&self, identity: &str, tier: Tier) -> Result<(), AdmissionError> {
        let now = self.clock.now();

        if let Some(block) = self.blocklist.is_blocked(identity, now) {
            warn!(
                identity = %identity,
                reason = %block.reason,
                audit = true,
                "Rejected blocked identity"
            );
            return Err(RateLimitExceeded {
                limit_type: LimitType::Blocked,
                retry_after: until(block.until, now),
            }
            .into());
        }

        let limits = self.tiers.get(tier);
        for window in Window::ORDER {
            let key = window.key(identity, now);
            let current = self.store.increment(&key, 1, window.ttl(now), now).await?;
            let limit = window.limit(limits);

            if current.count > limit {
                let retry_after = until(current.expires_at, now);
                warn!(
                    identity = %identity,
                    tier = %tier,
                    window = %window.limit_type(),
                    count = current.count,
                    limit = limit,
                    retry_after_ms = retry_after.as_millis() as u64,
                    audit = true,
                    "Rate limit exceeded"
                );
                return Err(RateLimitExceeded {
                    limit_type: window.limit_type(),
                    retry_after,
                }
                .into());
            }

            debug!(identity = %identity, key = %key, count = current.count, limit, "Window admitted");
        }

        Ok(())
    }
}
