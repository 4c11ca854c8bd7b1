// ABOUTME: Per-identity daily usage ledger of execution counts and estimated cost
// ABOUTME: Stored in the counter store under day-bucketed keys so rollover needs no cleanup job

use super::store::{CounterStore, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Ledger keys outlive their day so the previous day stays readable
const LEDGER_TTL: Duration = Duration::from_secs(48 * 60 * 60);

const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub executions: u64,
    pub cost_micros: u64,
}

impl LedgerEntry {
    pub fn cost(&self) -> f64 {
        self.cost_micros as f64 / MICROS_PER_DOLLAR
    }
}

pub fn to_micros(cost: f64) -> u64 {
    if cost.is_finite() && cost > 0.0 {
        (cost * MICROS_PER_DOLLAR).round() as u64
    } else {
        0
    }
}

#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn CounterStore>,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    fn keys(identity: &str, at: DateTime<Utc>) -> (String, String) {
        let day = at.format("%Y%m%d");
        (
            format!("{}:ledger_count:{}", identity, day),
            format!("{}:ledger_cost:{}", identity, day),
        )
    }

    /// Add one execution and its cost to today's entry
    pub async fn record(&self, identity: &str, cost: f64, at: DateTime<Utc>) -> Result<LedgerEntry> {
        let (count_key, cost_key) = Self::keys(identity, at);
        let executions = self.store.increment(&count_key, 1, LEDGER_TTL, at).await?;
        let spent = self
            .store
            .increment(&cost_key, to_micros(cost), LEDGER_TTL, at)
            .await?;
        Ok(LedgerEntry {
            executions: executions.count,
            cost_micros: spent.count,
        })
    }

    pub async fn entry(&self, identity: &str, at: DateTime<Utc>) -> Result<LedgerEntry> {
        let (count_key, cost_key) = Self::keys(identity, at);
        let executions = self.store.get(&count_key, at).await?;
        let spent = self.store.get(&cost_key, at).await?;
        Ok(LedgerEntry {
            executions: executions.map_or(0, |c| c.count),
            cost_micros: spent.map_or(0, |c| c.count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::store::MemoryCounterStore;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_ledger_accumulates_within_day() {
        let ledger = UsageLedger::new(Arc::new(MemoryCounterStore::new()));
        let morning = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();

        ledger.record("u1", 0.0015, morning).await.unwrap();
        let entry = ledger
            .record("u1", 0.0005, morning + chrono::Duration::hours(3))
            .await
            .unwrap();

        assert_eq!(entry.executions, 2);
        assert_eq!(entry.cost_micros, 2_000);
        assert!((entry.cost() - 0.002).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ledger_rolls_over_by_day() {
        let ledger = UsageLedger::new(Arc::new(MemoryCounterStore::new()));
        let late = Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 0).unwrap();
        ledger.record("u1", 1.0, late).await.unwrap();

        let next_day = late + chrono::Duration::minutes(2);
        assert_eq!(ledger.entry("u1", next_day).await.unwrap(), LedgerEntry::default());
        assert_eq!(ledger.entry("u1", late).await.unwrap().executions, 1);
    }

    #[test]
    fn test_to_micros_ignores_invalid_costs() {
        assert_eq!(to_micros(-1.0), 0);
        assert_eq!(to_micros(f64::NAN), 0);
        assert_eq!(to_micros(0.25), 250_000);
    }
}
