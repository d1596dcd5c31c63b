//! Phase derivation and the switch aggregate.
//!
//! [`derive_phase`] is a pure function of the two stored records and the
//! current instant; `ACTIVE → EXPIRED` is never written anywhere.
//! [`SwitchService`] owns every mutation path, so the ordering rules (check
//! the terminal latch first, ledger before fan-out) live in exactly one
//! place.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use rand::Rng;
use tokio::sync::broadcast;
use vigil_protocol::BroadcastOutcome;
use vigil_protocol::BroadcastPayload;
use vigil_protocol::LedgerEntry;
use vigil_protocol::LedgerKind;
use vigil_protocol::Phase;
use vigil_protocol::StateView;
use vigil_protocol::SwitchEvent;
use vigil_protocol::methods::ArmResult;
use vigil_protocol::methods::ResetResult;
use vigil_protocol::switch::GraceView;

use crate::config::VigilConfig;
use crate::error::Result;
use crate::error::SwitchError;
use crate::events::EventBus;
use crate::gateway::Publisher;
use crate::ledger::NewLedgerEntry;
use crate::ledger::compute_counters;
use crate::store::GraceRecord;
use crate::store::PrimaryRecord;
use crate::store::SwitchStore;

/// Actor recorded on ledger entries written by the service itself.
pub const SYSTEM_ACTOR: &str = "system";

/// Classify the switch at `now`. Terminal dominates everything; a pending
/// grace cycle dominates the primary countdown.
pub fn derive_phase(now: DateTime<Utc>, primary: &PrimaryRecord, grace: &GraceRecord) -> Phase {
    if primary.terminal {
        Phase::Terminal
    } else if grace.active {
        Phase::GracePending
    } else if primary.target_expiry <= now {
        Phase::Expired
    } else {
        Phase::Active
    }
}

pub struct SwitchService {
    store: Arc<dyn SwitchStore>,
    publisher: Arc<dyn Publisher>,
    events: EventBus,
    reset_window: Duration,
    grace_window: Duration,
    candidates: Vec<BroadcastPayload>,
}

impl SwitchService {
    pub fn new(
        store: Arc<dyn SwitchStore>,
        publisher: Arc<dyn Publisher>,
        config: &VigilConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            events: EventBus::new(),
            reset_window: config.reset_window(),
            grace_window: config.grace_window(),
            candidates: config.broadcast.candidates.clone(),
        }
    }

    /// Create the timer singletons if this is a fresh store. Safe on every
    /// start; an existing countdown (or terminal latch) is left untouched.
    pub fn bootstrap(&self, now: DateTime<Utc>) -> Result<()> {
        self.store.bootstrap(now, now + self.reset_window)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SwitchEvent> {
        self.events.subscribe()
    }

    /// Read model: records plus freshly recomputed counters.
    pub fn state(&self, now: DateTime<Utc>) -> Result<StateView> {
        let primary = self.store.primary()?;
        let grace = self.store.grace()?;
        let phase = derive_phase(now, &primary, &grace);
        let grace_view = match (&grace.trigger_at, &grace.payload) {
            (Some(trigger_at), Some(payload)) if grace.active => Some(GraceView {
                trigger_at: *trigger_at,
                payload: payload.clone(),
            }),
            _ => None,
        };
        Ok(StateView {
            phase,
            target_expiry: (!primary.terminal).then_some(primary.target_expiry),
            grace: grace_view,
            terminal: primary.terminal,
            counters: compute_counters(self.store.as_ref(), now)?,
            now,
        })
    }

    /// Push the expiry out one full window. Also cancels a pending grace
    /// cycle: an operator proving liveness always returns the switch to
    /// `Active`, even mid-grace.
    pub fn reset(
        &self,
        actor: &str,
        reason: Option<String>,
        location: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ResetResult> {
        let primary = self.store.primary()?;
        if primary.terminal {
            return Err(SwitchError::Frozen);
        }
        let remainder = (primary.target_expiry - now).num_seconds();
        let target_expiry = now + self.reset_window;
        self.store.set_primary_expiry(target_expiry, now)?;
        let cancelled_grace = self.store.disarm_grace(now)?;
        if cancelled_grace {
            tracing::info!(actor, "pending grace cycle cancelled by reset");
        }
        self.store.append(
            &NewLedgerEntry::new(LedgerKind::Reset, actor, now)
                .with_location(location)
                .with_remainder(remainder)
                .with_details(serde_json::json!({
                    "reason": reason,
                    "cancelled_grace": cancelled_grace,
                })),
        )?;
        let counters = compute_counters(self.store.as_ref(), now)?;
        tracing::info!(actor, %target_expiry, total = counters.total, "switch reset");
        self.events.emit(SwitchEvent::Reset {
            target_expiry,
            actor: actor.to_string(),
            counters,
        });
        Ok(ResetResult {
            target_expiry,
            counters,
        })
    }

    /// Arm the grace countdown with a randomly drawn payload. Repeat calls
    /// while a cycle is pending return the existing cycle unchanged, so two
    /// racing operators cannot shorten or re-roll it.
    pub fn start_grace(
        &self,
        actor: &str,
        location: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ArmResult> {
        let primary = self.store.primary()?;
        if primary.terminal {
            return Err(SwitchError::Frozen);
        }
        let grace = self.store.grace()?;
        if grace.active {
            let (trigger_at, payload) = match (grace.trigger_at, grace.payload) {
                (Some(trigger_at), Some(payload)) => (trigger_at, payload),
                _ => {
                    return Err(SwitchError::storage(
                        "active grace cycle is missing its trigger or payload",
                    ));
                }
            };
            return Ok(ArmResult {
                trigger_at,
                payload,
            });
        }
        if primary.target_expiry > now {
            return Err(SwitchError::precondition(format!(
                "primary timer has not expired ({}s remaining)",
                (primary.target_expiry - now).num_seconds()
            )));
        }
        let payload = self.pick_payload()?;
        let trigger_at = now + self.grace_window;
        self.store.arm_grace(trigger_at, &payload, now)?;
        self.store.append(
            &NewLedgerEntry::new(LedgerKind::Schedule, actor, now)
                .with_location(location)
                .with_remainder(self.grace_window.num_seconds())
                .with_details(serde_json::json!({
                    "trigger_at": trigger_at,
                    "payload": payload,
                })),
        )?;
        tracing::warn!(actor, %trigger_at, "grace cycle armed");
        self.events.emit(SwitchEvent::GraceStarted {
            trigger_at,
            payload: payload.clone(),
        });
        Ok(ArmResult {
            trigger_at,
            payload,
        })
    }

    /// Attempt the one-shot terminal transition. Returns `Ok(None)` when
    /// there was nothing due or another worker won the claim; `Ok(Some(_))`
    /// means this caller owned the broadcast, and the switch is now terminal
    /// whatever the outcome says.
    pub async fn claim_and_publish(&self, now: DateTime<Utc>) -> Result<Option<BroadcastOutcome>> {
        if self.store.primary()?.terminal {
            return Ok(None);
        }
        // The conditional update is the whole race: exactly one caller gets
        // a record back, and only that caller publishes.
        let Some(claimed) = self.store.claim_grace(now)? else {
            return Ok(None);
        };
        let outcome = match claimed.payload {
            Some(payload) => {
                self.append_best_effort(
                    NewLedgerEntry::new(LedgerKind::Sending, SYSTEM_ACTOR, now)
                        .with_details(serde_json::json!({ "payload": payload })),
                );
                match self.publisher.publish(&payload).await {
                    Ok(publication_id) => {
                        self.append_best_effort(
                            NewLedgerEntry::new(LedgerKind::Sent, SYSTEM_ACTOR, now)
                                .with_details(
                                    serde_json::json!({ "publication_id": publication_id }),
                                ),
                        );
                        BroadcastOutcome::Sent { publication_id }
                    }
                    Err(err) => self.record_failure(err.to_string(), now),
                }
            }
            None => self.record_failure(
                "grace cycle was armed without a payload".to_string(),
                now,
            ),
        };
        // Terminal latches on both outcomes. A failed broadcast is a spent
        // switch, not a retryable one.
        let latch = self.store.set_terminal(now);
        tracing::warn!(sent = outcome.is_sent(), "switch is terminal");
        self.events.emit(SwitchEvent::Terminal {
            outcome: outcome.clone(),
            occurred_at: now,
        });
        latch?;
        Ok(Some(outcome))
    }

    /// Audit trail of an operator authentication.
    pub fn record_login(
        &self,
        identity: &str,
        location: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .append(&NewLedgerEntry::new(LedgerKind::Login, identity, now).with_location(location))?;
        Ok(())
    }

    pub fn recent_ledger(&self, limit: u32) -> Result<Vec<LedgerEntry>> {
        self.store.recent(limit)
    }

    pub fn ledger_len(&self) -> Result<u64> {
        self.store.ledger_len()
    }

    fn pick_payload(&self) -> Result<BroadcastPayload> {
        if self.candidates.is_empty() {
            return Err(SwitchError::config("broadcast.candidates must not be empty"));
        }
        let idx = rand::rng().random_range(0..self.candidates.len());
        Ok(self.candidates[idx].clone())
    }

    fn record_failure(&self, error: String, now: DateTime<Utc>) -> BroadcastOutcome {
        tracing::error!(error, "terminal broadcast failed");
        self.append_best_effort(
            NewLedgerEntry::new(LedgerKind::Failed, SYSTEM_ACTOR, now)
                .with_details(serde_json::json!({ "error": error })),
        );
        BroadcastOutcome::Failed { error }
    }

    /// Outcome entries must not block the terminal latch, so append failures
    /// here are logged and swallowed.
    fn append_best_effort(&self, entry: NewLedgerEntry) {
        if let Err(err) = self.store.append(&entry) {
            tracing::warn!(
                kind = entry.kind.as_str(),
                error = %err,
                "failed to append ledger entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::gateway::StubPublisher;
    use crate::store::MemoryStore;

    fn test_config() -> VigilConfig {
        let mut config = VigilConfig::default();
        config.timer.reset_window_seconds = 600;
        config.timer.grace_window_seconds = 60;
        config.broadcast.candidates = vec![BroadcastPayload {
            text: "gone quiet".to_string(),
            url: "https://example.com/last".to_string(),
        }];
        config
    }

    fn service_with(
        store: Arc<MemoryStore>,
        publisher: Arc<StubPublisher>,
        now: DateTime<Utc>,
    ) -> SwitchService {
        let service = SwitchService::new(store, publisher, &test_config());
        service.bootstrap(now).unwrap();
        service
    }

    fn expire_primary(store: &MemoryStore, now: DateTime<Utc>) {
        store
            .set_primary_expiry(now - Duration::seconds(1), now)
            .unwrap();
    }

    fn primary_at(target_expiry: DateTime<Utc>, terminal: bool, now: DateTime<Utc>) -> PrimaryRecord {
        PrimaryRecord {
            target_expiry,
            terminal,
            created_at: now,
            updated_at: now,
        }
    }

    fn grace_at(active: bool, now: DateTime<Utc>) -> GraceRecord {
        GraceRecord {
            trigger_at: active.then(|| now + Duration::seconds(60)),
            active,
            payload: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn phase_derivation_table() {
        let now = Utc::now();
        let later = now + Duration::seconds(10);

        // Future expiry, no grace.
        assert_eq!(
            derive_phase(now, &primary_at(later, false, now), &grace_at(false, now)),
            Phase::Active
        );
        // Expiry exactly at now counts as lapsed.
        assert_eq!(
            derive_phase(now, &primary_at(now, false, now), &grace_at(false, now)),
            Phase::Expired
        );
        // Pending grace dominates the countdown comparison.
        assert_eq!(
            derive_phase(now, &primary_at(later, false, now), &grace_at(true, now)),
            Phase::GracePending
        );
        // Terminal dominates everything.
        assert_eq!(
            derive_phase(now, &primary_at(later, true, now), &grace_at(true, now)),
            Phase::Terminal
        );
    }

    #[test]
    fn reset_extends_expiry_and_recounts() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let service = service_with(store, Arc::new(StubPublisher::succeeding()), now);
        let mut events = service.subscribe_events();

        let result = service
            .reset("mara", Some("weekly check-in".to_string()), None, now)
            .unwrap();
        assert_eq!(result.target_expiry, now + Duration::seconds(600));
        assert_eq!(result.counters.total, 1);
        assert_eq!(result.counters.last_24h, 1);

        let entries = service.recent_ledger(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, LedgerKind::Reset);
        assert_eq!(entries[0].details["reason"], "weekly check-in");

        match events.try_recv().unwrap() {
            SwitchEvent::Reset { actor, counters, .. } => {
                assert_eq!(actor, "mara");
                assert_eq!(counters.total, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn reset_records_remaining_seconds_even_after_lapse() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let service = service_with(store.clone(), Arc::new(StubPublisher::succeeding()), now);
        store
            .set_primary_expiry(now - Duration::seconds(30), now)
            .unwrap();

        service.reset("mara", None, None, now).unwrap();
        let entries = service.recent_ledger(1).unwrap();
        assert_eq!(entries[0].remainder_seconds, Some(-30));
    }

    #[test]
    fn reset_cancels_a_pending_grace_cycle() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let service = service_with(store.clone(), Arc::new(StubPublisher::succeeding()), now);
        expire_primary(&store, now);
        service.start_grace("mara", None, now).unwrap();
        assert_eq!(service.state(now).unwrap().phase, Phase::GracePending);

        service.reset("kim", None, None, now).unwrap();
        let state = service.state(now).unwrap();
        assert_eq!(state.phase, Phase::Active);
        assert!(state.grace.is_none());

        let entries = service.recent_ledger(1).unwrap();
        assert_eq!(entries[0].details["cancelled_grace"], true);
    }

    #[test]
    fn start_grace_requires_a_lapsed_primary() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let service = service_with(store, Arc::new(StubPublisher::succeeding()), now);

        let err = service.start_grace("mara", None, now).unwrap_err();
        assert_eq!(err.kind(), "precondition");
    }

    #[test]
    fn start_grace_is_idempotent_while_pending() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let service = service_with(store.clone(), Arc::new(StubPublisher::succeeding()), now);
        expire_primary(&store, now);

        let first = service.start_grace("mara", None, now).unwrap();
        let second = service
            .start_grace("kim", None, now + Duration::seconds(5))
            .unwrap();
        assert_eq!(first.trigger_at, second.trigger_at);
        assert_eq!(first.payload, second.payload);

        // Exactly one schedule entry despite two calls.
        let schedules = service
            .recent_ledger(10)
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == LedgerKind::Schedule)
            .count();
        assert_eq!(schedules, 1);
    }

    #[tokio::test]
    async fn claim_is_a_noop_until_the_trigger_lapses() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(StubPublisher::succeeding());
        let service = service_with(store.clone(), publisher.clone(), now);
        expire_primary(&store, now);
        service.start_grace("mara", None, now).unwrap();

        assert!(service.claim_and_publish(now).await.unwrap().is_none());
        assert_eq!(publisher.publish_count(), 0);
        assert!(!service.state(now).unwrap().terminal);
    }

    #[tokio::test]
    async fn claim_publishes_once_and_latches_terminal() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(StubPublisher::succeeding());
        let service = service_with(store.clone(), publisher.clone(), now);
        let mut events = service.subscribe_events();
        expire_primary(&store, now);
        service.start_grace("mara", None, now).unwrap();

        let due = now + Duration::seconds(61);
        let outcome = service.claim_and_publish(due).await.unwrap();
        assert!(matches!(outcome, Some(BroadcastOutcome::Sent { .. })));
        assert_eq!(publisher.publish_count(), 1);

        let state = service.state(due).unwrap();
        assert_eq!(state.phase, Phase::Terminal);
        assert!(state.terminal);
        assert!(state.target_expiry.is_none());

        // Nothing left to claim, nothing republished.
        assert!(service.claim_and_publish(due).await.unwrap().is_none());
        assert_eq!(publisher.publish_count(), 1);

        let kinds: Vec<LedgerKind> = service
            .recent_ledger(10)
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![LedgerKind::Sent, LedgerKind::Sending, LedgerKind::Schedule]
        );

        // grace-started, then terminal.
        assert_eq!(events.try_recv().unwrap().name(), "grace-started");
        match events.try_recv().unwrap() {
            SwitchEvent::Terminal { outcome, .. } => assert!(outcome.is_sent()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_publish_still_latches_terminal() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(StubPublisher::failing("wire down"));
        let service = service_with(store.clone(), publisher.clone(), now);
        expire_primary(&store, now);
        service.start_grace("mara", None, now).unwrap();

        let due = now + Duration::seconds(61);
        let outcome = service.claim_and_publish(due).await.unwrap();
        match outcome {
            Some(BroadcastOutcome::Failed { error }) => {
                assert!(error.contains("wire down"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(service.state(due).unwrap().terminal);
        assert_eq!(publisher.publish_count(), 1);

        let failed = service
            .recent_ledger(10)
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == LedgerKind::Failed)
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn mutations_are_refused_once_terminal() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let service = service_with(store.clone(), Arc::new(StubPublisher::succeeding()), now);
        expire_primary(&store, now);
        service.start_grace("mara", None, now).unwrap();
        let due = now + Duration::seconds(61);
        service.claim_and_publish(due).await.unwrap();

        assert!(service.reset("mara", None, None, due).unwrap_err().is_frozen());
        assert!(service.start_grace("mara", None, due).unwrap_err().is_frozen());
    }

    #[test]
    fn logins_land_in_the_ledger() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let service = service_with(store, Arc::new(StubPublisher::succeeding()), now);
        service
            .record_login("mara", Some("home".to_string()), now)
            .unwrap();

        let entries = service.recent_ledger(1).unwrap();
        assert_eq!(entries[0].kind, LedgerKind::Login);
        assert_eq!(entries[0].actor, "mara");
        assert_eq!(entries[0].location.as_deref(), Some("home"));
        assert_eq!(service.ledger_len().unwrap(), 1);
    }

    #[test]
    fn state_exposes_the_pending_grace_cycle() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let service = service_with(store.clone(), Arc::new(StubPublisher::succeeding()), now);
        expire_primary(&store, now);
        let armed = service.start_grace("mara", None, now).unwrap();

        let state = service.state(now).unwrap();
        assert_eq!(state.phase, Phase::GracePending);
        let grace = state.grace.unwrap();
        assert_eq!(grace.trigger_at, armed.trigger_at);
        assert_eq!(grace.payload, armed.payload);
    }
}
