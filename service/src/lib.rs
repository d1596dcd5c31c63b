//! The vigil daemon: a Unix-domain-socket JSON-RPC-lite front end over the
//! `vigil-core` switch aggregate, plus the in-process expiration poller.
//! Wire types live in `vigil-protocol`; this crate owns only transport and
//! dispatch.

pub mod ipc;

use std::sync::Arc;
use std::time::Instant;

use vigil_core::SwitchService;
use vigil_core::auth::SessionBroker;

/// Per-process state every connection handler dispatches against.
pub struct Daemon {
    pub(crate) switch: Arc<SwitchService>,
    pub(crate) sessions: SessionBroker,
    pub(crate) poll_interval_s: u64,
    started_at: Instant,
}

impl Daemon {
    pub fn new(switch: Arc<SwitchService>, sessions: SessionBroker, poll_interval_s: u64) -> Self {
        Self {
            switch,
            sessions,
            poll_interval_s,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn uptime_s(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
