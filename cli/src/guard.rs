//! Client-side terminal latch.
//!
//! The service refuses mutations once the switch is terminal, but a client
//! should not even send them. `TerminalGuard` latches the first terminal
//! observation, wherever it comes from: a fetched state, a pushed event, a
//! ledger entry, or a frozen-error reply. It never unlatches. Callers feed
//! it every update they see, since the terminal transition can happen while
//! the client sits idle between polls.

use serde_json::Value;
use vigil_protocol::BroadcastOutcome;
use vigil_protocol::LedgerEntry;
use vigil_protocol::LedgerKind;
use vigil_protocol::Phase;
use vigil_protocol::StateView;
use vigil_protocol::SwitchEvent;
use vigil_protocol::methods::ERR_FROZEN;

#[derive(Debug, Default)]
pub struct TerminalGuard {
    latched: bool,
    outcome: Option<BroadcastOutcome>,
}

impl TerminalGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_state(&mut self, state: &StateView) {
        if state.terminal || state.phase == Phase::Terminal {
            self.latched = true;
        }
    }

    pub fn observe_event(&mut self, event: &SwitchEvent) {
        if let SwitchEvent::Terminal { outcome, .. } = event {
            self.latched = true;
            self.outcome = Some(outcome.clone());
        }
    }

    /// The broadcast outcome survives only in the ledger once the event has
    /// passed, so `Sent`/`Failed` entries reconstruct it for the banner.
    pub fn observe_ledger_entry(&mut self, entry: &LedgerEntry) {
        match entry.kind {
            LedgerKind::Sent => {
                self.latched = true;
                if self.outcome.is_none() {
                    let publication_id = entry
                        .details
                        .get("publication_id")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    self.outcome = Some(BroadcastOutcome::Sent { publication_id });
                }
            }
            LedgerKind::Failed => {
                self.latched = true;
                if self.outcome.is_none() {
                    let error = entry
                        .details
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    self.outcome = Some(BroadcastOutcome::Failed { error });
                }
            }
            _ => {}
        }
    }

    /// A frozen reply means the service latched before we did.
    pub fn observe_error_code(&mut self, code: Option<i64>) {
        if code == Some(ERR_FROZEN) {
            self.latched = true;
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.latched
    }

    /// Gate for anything that would mutate the switch.
    pub fn check_mutation(&self, action: &str) -> Result<(), String> {
        if self.latched {
            Err(format!(
                "the switch is terminal; {action} is no longer possible"
            ))
        } else {
            Ok(())
        }
    }

    pub fn banner(&self) -> String {
        let mut banner = String::from(
            "── THE SWITCH IS TERMINAL ──\nThe broadcast has fired. Nothing can be reset or re-armed.",
        );
        match &self.outcome {
            Some(BroadcastOutcome::Sent { publication_id }) => {
                banner.push_str(&format!(
                    "\nBroadcast delivered (publication {publication_id})."
                ));
            }
            Some(BroadcastOutcome::Failed { error }) => {
                banner.push_str(&format!("\nBroadcast attempt failed: {error}"));
            }
            None => {}
        }
        banner
    }
}
