//! Shared model of the switch: phases, timer views, ledger entries, and the
//! events fanned out to subscribed clients.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Derived lifecycle phase of the switch.
///
/// `Active → Expired` is never stored; it falls out of comparing the primary
/// timer's expiry against the current instant. `Terminal` is permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Active,
    Expired,
    GracePending,
    Terminal,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::GracePending => "grace_pending",
            Self::Terminal => "terminal",
        }
    }
}

/// The message handed to the broadcast transport when the grace timer lapses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub text: String,
    pub url: String,
}

/// Rolling counters derived from the ledger on every observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetCounters {
    pub total: u64,
    pub last_24h: u64,
}

/// Grace cycle details exposed while a cycle is pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraceView {
    pub trigger_at: DateTime<Utc>,
    pub payload: BroadcastPayload,
}

/// Full read model returned by `switch.state`.
///
/// `target_expiry` is null once the switch is terminal; `grace` is null
/// unless a grace cycle is pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateView {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace: Option<GraceView>,
    pub terminal: bool,
    pub counters: ResetCounters,
    pub now: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────────────────────────

/// What a ledger entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    /// An operator reset the primary timer.
    Reset,
    /// A grace cycle was armed with a chosen payload.
    Schedule,
    /// A poller claimed the lapsed grace cycle and is about to publish.
    Sending,
    /// The publish call succeeded.
    Sent,
    /// The publish call failed; the cycle still ended terminally.
    Failed,
    /// An operator authenticated.
    Login,
}

impl LedgerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Schedule => "schedule",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Login => "login",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reset" => Some(Self::Reset),
            "schedule" => Some(Self::Schedule),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "login" => Some(Self::Login),
            _ => None,
        }
    }
}

/// One immutable, append-only audit record. `seq` is assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub kind: LedgerKind,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Seconds left on the relevant countdown when the action occurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remainder_seconds: Option<i64>,
    #[serde(default)]
    pub details: serde_json::Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// Fan-out events
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of the one-shot broadcast attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BroadcastOutcome {
    Sent { publication_id: String },
    Failed { error: String },
}

impl BroadcastOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }
}

/// Events pushed over the realtime channel to subscribed clients.
///
/// Delivery is best-effort and at-most-once per connected session; clients
/// reconcile against `switch.state` on a fallback interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SwitchEvent {
    Reset {
        target_expiry: DateTime<Utc>,
        actor: String,
        counters: ResetCounters,
    },
    GraceStarted {
        trigger_at: DateTime<Utc>,
        payload: BroadcastPayload,
    },
    Terminal {
        outcome: BroadcastOutcome,
        occurred_at: DateTime<Utc>,
    },
}

impl SwitchEvent {
    /// Wire name of the event, as carried in the `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reset { .. } => "reset",
            Self::GraceStarted { .. } => "grace-started",
            Self::Terminal { .. } => "terminal",
        }
    }
}
