//! Durable state: the two timer singletons and the append-only ledger.
//!
//! Stores are synchronous and internally locked. Every write is
//! last-writer-wins except [`SwitchStore::claim_grace`], the single
//! conditional write the exactly-once broadcast guarantee rests on.

mod memory;
mod sqlite;

use chrono::DateTime;
use chrono::Utc;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
use vigil_protocol::BroadcastPayload;
use vigil_protocol::LedgerEntry;

use crate::error::Result;
use crate::ledger::NewLedgerEntry;

/// The primary countdown singleton. `terminal` moves false→true only.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryRecord {
    pub target_expiry: DateTime<Utc>,
    pub terminal: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The grace countdown singleton. At most one cycle is active at a time;
/// `trigger_at` and `payload` are kept after deactivation for the audit view.
#[derive(Debug, Clone, PartialEq)]
pub struct GraceRecord {
    pub trigger_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub payload: Option<BroadcastPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub trait SwitchStore: Send + Sync {
    /// Create both singletons if absent. Safe to call on every start.
    fn bootstrap(&self, now: DateTime<Utc>, initial_expiry: DateTime<Utc>) -> Result<()>;

    fn primary(&self) -> Result<PrimaryRecord>;

    fn grace(&self) -> Result<GraceRecord>;

    /// Move the primary countdown. Last-writer-wins. The terminal flag is
    /// deliberately out of reach here; only [`SwitchStore::set_terminal`]
    /// writes it.
    fn set_primary_expiry(&self, target_expiry: DateTime<Utc>, now: DateTime<Utc>) -> Result<()>;

    /// Arm a grace cycle with its trigger instant and chosen payload.
    /// Last-writer-wins.
    fn arm_grace(
        &self,
        trigger_at: DateTime<Utc>,
        payload: &BroadcastPayload,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Deactivate a pending grace cycle, keeping its trigger and payload for
    /// the audit view. Returns whether a cycle was actually pending.
    fn disarm_grace(&self, now: DateTime<Utc>) -> Result<bool>;

    /// Atomically deactivate the grace cycle iff it is active and due at
    /// `now`. Returns the deactivated record (trigger and payload intact)
    /// when this caller won the claim, `None` when another caller won or
    /// nothing was due. This is the only compare-and-set in the system.
    fn claim_grace(&self, now: DateTime<Utc>) -> Result<Option<GraceRecord>>;

    /// Latch the terminal flag. Idempotent, never reversed.
    fn set_terminal(&self, now: DateTime<Utc>) -> Result<()>;

    /// Append one immutable entry; the store assigns the sequence number.
    fn append(&self, entry: &NewLedgerEntry) -> Result<LedgerEntry>;

    fn count_resets(&self) -> Result<u64>;

    fn count_resets_since(&self, since: DateTime<Utc>) -> Result<u64>;

    /// Newest-first slice of the ledger.
    fn recent(&self, limit: u32) -> Result<Vec<LedgerEntry>>;

    fn ledger_len(&self) -> Result<u64>;
}
