//! Ledger entry construction and counter derivation.
//!
//! The ledger is the source of truth for reset counters: they are recomputed
//! by query on every observation, never cached or incremented in place, so a
//! restart or a concurrent writer can never skew them.

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use vigil_protocol::LedgerEntry;
use vigil_protocol::LedgerKind;
use vigil_protocol::ResetCounters;

use crate::error::Result;
use crate::store::SwitchStore;

/// An entry not yet assigned a sequence number by the store.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub kind: LedgerKind,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
    pub location: Option<String>,
    pub remainder_seconds: Option<i64>,
    pub details: serde_json::Value,
}

impl NewLedgerEntry {
    pub fn new(kind: LedgerKind, actor: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            actor: actor.into(),
            occurred_at,
            location: None,
            remainder_seconds: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    pub fn with_remainder(mut self, seconds: i64) -> Self {
        self.remainder_seconds = Some(seconds);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Finalize with the sequence number the store assigned.
    pub fn into_entry(self, seq: u64) -> LedgerEntry {
        LedgerEntry {
            seq,
            kind: self.kind,
            actor: self.actor,
            occurred_at: self.occurred_at,
            location: self.location,
            remainder_seconds: self.remainder_seconds,
            details: self.details,
        }
    }
}

/// Counters are two fresh `COUNT` queries against the ledger.
pub fn compute_counters(store: &dyn SwitchStore, now: DateTime<Utc>) -> Result<ResetCounters> {
    let total = store.count_resets()?;
    let last_24h = store.count_resets_since(now - Duration::hours(24))?;
    Ok(ResetCounters { total, last_24h })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_carries_metadata() {
        let now = Utc::now();
        let entry = NewLedgerEntry::new(LedgerKind::Reset, "mara", now)
            .with_location(Some("home".to_string()))
            .with_remainder(42)
            .with_details(serde_json::json!({ "reason": "weekly check-in" }));
        let stored = entry.into_entry(7);
        assert_eq!(stored.seq, 7);
        assert_eq!(stored.kind, LedgerKind::Reset);
        assert_eq!(stored.actor, "mara");
        assert_eq!(stored.location.as_deref(), Some("home"));
        assert_eq!(stored.remainder_seconds, Some(42));
        assert_eq!(stored.details["reason"], "weekly check-in");
    }

    #[test]
    fn counters_come_from_the_store() {
        let store = crate::store::MemoryStore::new();
        let now = Utc::now();
        store.bootstrap(now, now + Duration::hours(1)).unwrap();
        for age_hours in [1, 2, 30] {
            let entry = NewLedgerEntry::new(
                LedgerKind::Reset,
                "mara",
                now - Duration::hours(age_hours),
            );
            store.append(&entry).unwrap();
        }
        // A non-reset kind never counts.
        store
            .append(&NewLedgerEntry::new(LedgerKind::Login, "mara", now))
            .unwrap();

        let counters = compute_counters(&store, now).unwrap();
        assert_eq!(counters.total, 3);
        assert_eq!(counters.last_24h, 2);
    }
}
