// ABOUTME: Usage and abuse monitor fed asynchronously with one event per request
// ABOUTME: Keeps per-identity session statistics, writes the daily ledger and raises expiring blocks

use crate::admission::{BlockEntry, BlockList, LedgerEntry, UsageLedger};
use crate::clock::to_chrono;
use crate::cost::CostCalculator;
use crate::settings::{CostModel, MonitorConfig};
use crate::types::{Engine, ErrorKind, LimitType, Tier};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct UsageEvent {
    pub identity: String,
    pub tier: Tier,
    /// Engine that ran the code; `None` when the request never reached one
    pub engine: Option<Engine>,
    pub error_kind: ErrorKind,
    pub limit_type: Option<LimitType>,
    pub duration: Duration,
    pub memory_mb: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    #[serde(skip)]
    recent: VecDeque<DateTime<Utc>>,
    pub total: u64,
    pub errors: u64,
}

impl SessionStats {
    fn observe(&mut self, at: DateTime<Utc>, is_error: bool) {
        let horizon = at - ChronoDuration::minutes(1);
        self.recent.push_back(at);
        while self.recent.front().is_some_and(|t| *t <= horizon) {
            self.recent.pop_front();
        }
        self.total += 1;
        if is_error {
            self.errors += 1;
        }
    }

    pub fn last_minute(&self) -> usize {
        self.recent.len()
    }

    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.errors as f64 / self.total as f64
        }
    }
}

pub struct UsageMonitor {
    config: MonitorConfig,
    cost: CostCalculator,
    ledger: UsageLedger,
    blocklist: BlockList,
    sessions: Mutex<HashMap<String, SessionStats>>,
}

impl UsageMonitor {
    pub fn new(config: MonitorConfig, cost: CostModel, ledger: UsageLedger, blocklist: BlockList) -> Self {
        Self {
            config,
            cost: CostCalculator::new(cost),
            ledger,
            blocklist,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Account for one request; returns the block it triggered, if any
    pub async fn record(&self, event: UsageEvent) -> Option<BlockEntry> {
        if event.limit_type == Some(LimitType::Blocked) {
            return None;
        }

        let stats = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let stats = sessions.entry(event.identity.clone()).or_default();
            stats.observe(event.at, event.error_kind.is_error());
            stats.clone()
        };

        let ledger = match event.engine {
            Some(engine) => self.charge(&event, engine).await,
            None => None,
        };

        let reason = self.breach(&stats, ledger.as_ref())?;
        let until = event.at + to_chrono(self.config.block_duration());
        self.blocklist.block(&event.identity, reason.clone(), until);
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&event.identity);

        warn!(
            identity = %event.identity,
            tier = %event.tier,
            reason = %reason,
            until = %until,
            audit = true,
            "Identity blocked"
        );
        Some(BlockEntry { reason, until })
    }

    async fn charge(&self, event: &UsageEvent, engine: Engine) -> Option<LedgerEntry> {
        let cost = self.cost.estimate(engine, event.duration, event.memory_mb);
        match self
            .ledger
            .record(&event.identity, cost.total_cost, event.at)
            .await
        {
            Ok(entry) => {
                debug!(
                    identity = %event.identity,
                    engine = %engine,
                    executions = entry.executions,
                    cost = entry.cost(),
                    "Ledger updated"
                );
                Some(entry)
            }
            Err(e) => {
                warn!(identity = %event.identity, error = %e, "Failed to update usage ledger");
                None
            }
        }
    }

    fn breach(&self, stats: &SessionStats, ledger: Option<&LedgerEntry>) -> Option<String> {
        if stats.last_minute() > self.config.max_executions_per_minute {
            return Some(format!(
                "more than {} requests in a minute",
                self.config.max_executions_per_minute
            ));
        }
        if stats.total >= self.config.min_samples
            && stats.error_rate() >= self.config.error_rate_threshold
        {
            return Some(format!(
                "error rate {:.0}% over {} requests",
                stats.error_rate() * 100.0,
                stats.total
            ));
        }
        if let Some(entry) = ledger {
            if !self.cost.is_within_limit(entry.cost(), self.config.daily_cost_limit) {
                return Some(format!(
                    "daily cost {:.4} over limit {:.4}",
                    entry.cost(),
                    self.config.daily_cost_limit
                ));
            }
        }
        None
    }

    pub fn session(&self, identity: &str) -> Option<SessionStats> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.get(identity).cloned()
    }

    /// Drop sessions with no request in the last minute; returns how many went
    pub fn purge_idle(&self, now: DateTime<Utc>) -> usize {
        let horizon = now - ChronoDuration::minutes(1);
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, stats| stats.recent.back().is_some_and(|last| *last > horizon));
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, remaining = sessions.len(), "Purged idle monitor sessions");
        }
        removed
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Run the monitor as a background task fed by the returned handle
    pub fn spawn(self: Arc<Self>) -> (MonitorHandle, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<UsageEvent>();
        let task = tokio::spawn(async move {
            info!("Usage monitor started");
            while let Some(event) = receiver.recv().await {
                self.record(event).await;
            }
            info!("Usage monitor stopped");
        });
        (MonitorHandle { sender }, task)
    }
}

/// Sending side of the monitor channel; never blocks
#[derive(Clone)]
pub struct MonitorHandle {
    sender: mpsc::UnboundedSender<UsageEvent>,
}

impl MonitorHandle {
    pub fn send(&self, event: UsageEvent) {
        if self.sender.send(event).is_err() {
            debug!("Usage monitor is gone, dropping event");
        }
    }
}
