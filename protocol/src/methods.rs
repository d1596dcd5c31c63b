//! Method names, error codes, and parameter/result payloads for the IPC
//! surface. `switch.reset` and `switch.arm` carry an operator session token;
//! `switch.claim` carries the shared service credential; reads are open.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::switch::BroadcastOutcome;
use crate::switch::BroadcastPayload;
use crate::switch::LedgerEntry;
use crate::switch::Phase;
use crate::switch::ResetCounters;

/// Bumped whenever the wire surface changes incompatibly. `hello` rejects
/// clients that speak a different version.
pub const PROTOCOL_VERSION: u32 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// Method names
// ─────────────────────────────────────────────────────────────────────────────

pub const METHOD_HELLO: &str = "hello";
pub const METHOD_AUTH_LOGIN: &str = "auth.login";
pub const METHOD_SWITCH_STATE: &str = "switch.state";
pub const METHOD_SWITCH_RESET: &str = "switch.reset";
pub const METHOD_SWITCH_ARM: &str = "switch.arm";
pub const METHOD_SWITCH_CLAIM: &str = "switch.claim";
pub const METHOD_SWITCH_LEDGER: &str = "switch.ledger";
pub const METHOD_SWITCH_SUBSCRIBE: &str = "switch.subscribe";
pub const METHOD_SERVICE_STATUS: &str = "service.status";

/// Server-initiated notification carrying a [`crate::switch::SwitchEvent`].
pub const NOTIFY_SWITCH_EVENT: &str = "switch.event";

// ─────────────────────────────────────────────────────────────────────────────
// Error codes
// ─────────────────────────────────────────────────────────────────────────────

pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;

/// Missing, expired, or insufficient credentials.
pub const ERR_AUTH: i64 = 10;
/// Mutation refused because the switch is terminal.
pub const ERR_FROZEN: i64 = 100;
/// Operation not valid in the current phase.
pub const ERR_PRECONDITION: i64 = 101;
/// The backing store rejected or lost the operation.
pub const ERR_STORAGE: i64 = 200;
/// The broadcast transport failed.
pub const ERR_PUBLISH: i64 = 201;
/// Anything else inside the service.
pub const ERR_INFRA: i64 = 300;

// ─────────────────────────────────────────────────────────────────────────────
// hello
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: u32,
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: u32,
    pub service_version: String,
    pub capabilities: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// auth.login
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginParams {
    pub identity: String,
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResult {
    pub token: String,
    pub identity: String,
    pub expires_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// switch.state (no params; result is `StateView` directly)
// ─────────────────────────────────────────────────────────────────────────────

// ─────────────────────────────────────────────────────────────────────────────
// switch.reset
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetParams {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResult {
    pub target_expiry: DateTime<Utc>,
    pub counters: ResetCounters,
}

// ─────────────────────────────────────────────────────────────────────────────
// switch.arm
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmParams {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Repeat calls while a cycle is pending return the existing values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmResult {
    pub trigger_at: DateTime<Utc>,
    pub payload: BroadcastPayload,
}

// ─────────────────────────────────────────────────────────────────────────────
// switch.claim
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimParams {
    pub service_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResult {
    /// False when another worker won the claim or nothing was due.
    pub claimed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<BroadcastOutcome>,
}

// ─────────────────────────────────────────────────────────────────────────────
// switch.ledger
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerParams {
    /// Newest-first cap; the service applies its own ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerResult {
    pub entries: Vec<LedgerEntry>,
}

// ─────────────────────────────────────────────────────────────────────────────
// switch.subscribe (no params)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeResult {
    pub subscribed: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// service.status (no params)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusResult {
    pub uptime_s: u64,
    pub phase: Phase,
    pub terminal: bool,
    pub poll_interval_s: u64,
    pub ledger_len: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reset_params_omit_absent_metadata() {
        let params = ResetParams {
            token: "t".to_string(),
            reason: None,
            location: None,
        };
        let encoded = serde_json::to_value(&params).unwrap();
        assert_eq!(encoded, serde_json::json!({ "token": "t" }));
    }

    #[test]
    fn login_params_accept_minimal_form() {
        let params: LoginParams = serde_json::from_value(serde_json::json!({
            "identity": "mara",
            "secret": "hunter2",
        }))
        .unwrap();
        assert_eq!(params.identity, "mara");
        assert_eq!(params.secret, "hunter2");
        assert!(params.location.is_none());
    }

    #[test]
    fn ledger_params_default_to_no_limit() {
        let params: LedgerParams = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(params.limit.is_none());
    }

    #[test]
    fn domain_error_codes_stay_disjoint_from_jsonrpc() {
        for code in [
            ERR_AUTH,
            ERR_FROZEN,
            ERR_PRECONDITION,
            ERR_STORAGE,
            ERR_PUBLISH,
            ERR_INFRA,
        ] {
            assert!(code > 0);
        }
    }
}
