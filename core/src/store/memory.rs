//! In-memory store for ephemeral deployments and tests. Same semantics as
//! the SQLite store, minus durability.

use std::sync::Mutex;
use std::sync::MutexGuard;

use chrono::DateTime;
use chrono::Utc;
use vigil_protocol::BroadcastPayload;
use vigil_protocol::LedgerEntry;
use vigil_protocol::LedgerKind;

use crate::error::Result;
use crate::error::SwitchError;
use crate::ledger::NewLedgerEntry;
use crate::store::GraceRecord;
use crate::store::PrimaryRecord;
use crate::store::SwitchStore;

#[derive(Default)]
struct Inner {
    primary: Option<PrimaryRecord>,
    grace: Option<GraceRecord>,
    ledger: Vec<LedgerEntry>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| SwitchError::storage("store mutex poisoned"))
    }
}

impl SwitchStore for MemoryStore {
    fn bootstrap(&self, now: DateTime<Utc>, initial_expiry: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.primary.is_none() {
            inner.primary = Some(PrimaryRecord {
                target_expiry: initial_expiry,
                terminal: false,
                created_at: now,
                updated_at: now,
            });
        }
        if inner.grace.is_none() {
            inner.grace = Some(GraceRecord {
                trigger_at: None,
                active: false,
                payload: None,
                created_at: now,
                updated_at: now,
            });
        }
        Ok(())
    }

    fn primary(&self) -> Result<PrimaryRecord> {
        self.lock()?
            .primary
            .clone()
            .ok_or_else(|| SwitchError::storage("primary timer missing; store not bootstrapped"))
    }

    fn grace(&self) -> Result<GraceRecord> {
        self.lock()?
            .grace
            .clone()
            .ok_or_else(|| SwitchError::storage("grace timer missing; store not bootstrapped"))
    }

    fn set_primary_expiry(&self, target_expiry: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        let primary = inner.primary.as_mut().ok_or_else(|| {
            SwitchError::storage("primary timer missing; store not bootstrapped")
        })?;
        primary.target_expiry = target_expiry;
        primary.updated_at = now;
        Ok(())
    }

    fn arm_grace(
        &self,
        trigger_at: DateTime<Utc>,
        payload: &BroadcastPayload,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let grace = inner
            .grace
            .as_mut()
            .ok_or_else(|| SwitchError::storage("grace timer missing; store not bootstrapped"))?;
        grace.trigger_at = Some(trigger_at);
        grace.active = true;
        grace.payload = Some(payload.clone());
        grace.updated_at = now;
        Ok(())
    }

    fn disarm_grace(&self, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.grace.as_mut() {
            Some(grace) if grace.active => {
                grace.active = false;
                grace.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn claim_grace(&self, now: DateTime<Utc>) -> Result<Option<GraceRecord>> {
        let mut inner = self.lock()?;
        match inner.grace.as_mut() {
            Some(grace)
                if grace.active && grace.trigger_at.is_some_and(|t| t <= now) =>
            {
                grace.active = false;
                grace.updated_at = now;
                Ok(Some(grace.clone()))
            }
            _ => Ok(None),
        }
    }

    fn set_terminal(&self, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(primary) = inner.primary.as_mut() {
            primary.terminal = true;
            primary.updated_at = now;
        }
        Ok(())
    }

    fn append(&self, entry: &NewLedgerEntry) -> Result<LedgerEntry> {
        let mut inner = self.lock()?;
        inner.next_seq += 1;
        let stored = entry.clone().into_entry(inner.next_seq);
        inner.ledger.push(stored.clone());
        Ok(stored)
    }

    fn count_resets(&self) -> Result<u64> {
        let inner = self.lock()?;
        Ok(inner
            .ledger
            .iter()
            .filter(|e| e.kind == LedgerKind::Reset)
            .count() as u64)
    }

    fn count_resets_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let inner = self.lock()?;
        Ok(inner
            .ledger
            .iter()
            .filter(|e| e.kind == LedgerKind::Reset && e.occurred_at >= since)
            .count() as u64)
    }

    fn recent(&self, limit: u32) -> Result<Vec<LedgerEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .ledger
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn ledger_len(&self) -> Result<u64> {
        Ok(self.lock()?.ledger.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn bootstrap_is_idempotent() {
        let now = Utc::now();
        let store = MemoryStore::new();
        store.bootstrap(now, now + Duration::hours(1)).unwrap();
        let first = store.primary().unwrap();
        store
            .bootstrap(now + Duration::hours(5), now + Duration::hours(9))
            .unwrap();
        assert_eq!(store.primary().unwrap(), first);
    }

    #[test]
    fn claim_matches_sqlite_semantics() {
        let now = Utc::now();
        let store = MemoryStore::new();
        store.bootstrap(now, now + Duration::hours(1)).unwrap();
        let payload = BroadcastPayload {
            text: "gone quiet".to_string(),
            url: "https://example.com/last".to_string(),
        };
        store
            .arm_grace(now - Duration::seconds(1), &payload, now)
            .unwrap();

        assert!(store.claim_grace(now).unwrap().is_some());
        assert!(store.claim_grace(now).unwrap().is_none());
        assert!(!store.grace().unwrap().active);
    }

    #[test]
    fn disarm_reports_whether_a_cycle_was_pending() {
        let now = Utc::now();
        let store = MemoryStore::new();
        store.bootstrap(now, now + Duration::hours(1)).unwrap();
        assert!(!store.disarm_grace(now).unwrap());

        let payload = BroadcastPayload {
            text: "gone quiet".to_string(),
            url: "https://example.com/last".to_string(),
        };
        store
            .arm_grace(now + Duration::minutes(10), &payload, now)
            .unwrap();
        assert!(store.disarm_grace(now).unwrap());
        assert!(!store.grace().unwrap().active);
    }

    #[test]
    fn recent_is_newest_first() {
        let now = Utc::now();
        let store = MemoryStore::new();
        store.bootstrap(now, now + Duration::hours(1)).unwrap();
        for i in 0..4 {
            store
                .append(
                    &NewLedgerEntry::new(LedgerKind::Reset, "mara", now).with_remainder(i),
                )
                .unwrap();
        }
        let entries = store.recent(2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].remainder_seconds, Some(3));
        assert_eq!(entries[1].remainder_seconds, Some(2));
    }
}
