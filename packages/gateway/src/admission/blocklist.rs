// ABOUTME: Expiring block flags raised by the abuse monitor
// ABOUTME: Admission consults this before touching any quota window

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockEntry {
    pub reason: String,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct BlockList {
    entries: Arc<RwLock<HashMap<String, BlockEntry>>>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, identity: &str, reason: impl Into<String>, until: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            identity.to_string(),
            BlockEntry {
                reason: reason.into(),
                until,
            },
        );
    }

    pub fn unblock(&self, identity: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(identity).is_some()
    }

    /// Active block for `identity`; expired blocks are dropped on read
    pub fn is_blocked(&self, identity: &str, now: DateTime<Utc>) -> Option<BlockEntry> {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(identity) {
                None => return None,
                Some(entry) if entry.until > now => return Some(entry.clone()),
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(identity).is_some_and(|e| e.until <= now) {
            entries.remove(identity);
        }
        None
    }

    pub fn active(&self, now: DateTime<Utc>) -> Vec<(String, BlockEntry)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|(_, e)| e.until > now)
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_block_expires() {
        let blocks = BlockList::new();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        blocks.block("u1", "error rate", now + chrono::Duration::minutes(15));

        let entry = blocks.is_blocked("u1", now).unwrap();
        assert_eq!(entry.reason, "error rate");
        assert!(blocks.is_blocked("u2", now).is_none());

        let after = now + chrono::Duration::minutes(15);
        assert!(blocks.is_blocked("u1", after).is_none());
        assert!(blocks.active(now).is_empty());
    }

    #[test]
    fn test_unblock() {
        let blocks = BlockList::new();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        blocks.block("u1", "manual", now + chrono::Duration::hours(1));
        assert!(blocks.unblock("u1"));
        assert!(!blocks.unblock("u1"));
        assert!(blocks.is_blocked("u1", now).is_none());
    }
}
