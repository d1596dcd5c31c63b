//! Plain-text rendering for switch state, ledger entries, and pushed events.

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use vigil_protocol::BroadcastOutcome;
use vigil_protocol::LedgerEntry;
use vigil_protocol::StateView;
use vigil_protocol::SwitchEvent;

/// `"3d 2h"`, `"5m 12s"`, `"47s"`. Negative inputs read as elapsed time.
pub fn human_duration(seconds: i64) -> String {
    let total = seconds.abs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let secs = total % 60;
    let core = if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    };
    if seconds < 0 { format!("{core} ago") } else { core }
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Multi-line summary of a fetched state, countdowns relative to the
/// service's own clock so a skewed client cannot misreport them.
pub fn state_block(state: &StateView) -> String {
    let mut lines = vec![format!("phase:   {}", state.phase.as_str())];
    if let Some(target_expiry) = state.target_expiry {
        let left = (target_expiry - state.now).num_seconds();
        if left >= 0 {
            lines.push(format!(
                "expires: in {} ({})",
                human_duration(left),
                stamp(target_expiry)
            ));
        } else {
            lines.push(format!(
                "expired: {} ({})",
                human_duration(left),
                stamp(target_expiry)
            ));
        }
    }
    if let Some(grace) = &state.grace {
        let left = (grace.trigger_at - state.now).num_seconds();
        lines.push(format!(
            "grace:   fires in {} ({})",
            human_duration(left),
            stamp(grace.trigger_at)
        ));
        lines.push(format!("payload: \"{}\"", grace.payload.text));
    }
    lines.push(format!(
        "resets:  {} total, {} in the last 24h",
        state.counters.total, state.counters.last_24h
    ));
    lines.join("\n")
}

/// One ledger entry on one line, newest-first listing.
pub fn ledger_line(entry: &LedgerEntry) -> String {
    let mut line = format!(
        "#{:<5} {}  {:<8} {}",
        entry.seq,
        stamp(entry.occurred_at),
        entry.kind.as_str(),
        entry.actor
    );
    if let Some(location) = &entry.location {
        line.push_str(&format!("  @{location}"));
    }
    if let Some(remainder) = entry.remainder_seconds {
        if remainder >= 0 {
            line.push_str(&format!("  ({} left)", human_duration(remainder)));
        } else {
            line.push_str(&format!("  (lapsed {})", human_duration(remainder)));
        }
    }
    line
}

/// One pushed event on one line, for `watch`.
pub fn event_line(event: &SwitchEvent) -> String {
    match event {
        SwitchEvent::Reset {
            target_expiry,
            actor,
            counters,
        } => format!(
            "[reset] by {actor}; next expiry {} (resets: {})",
            stamp(*target_expiry),
            counters.total
        ),
        SwitchEvent::GraceStarted {
            trigger_at,
            payload,
        } => format!(
            "[grace-started] fires at {}; payload: \"{}\"",
            stamp(*trigger_at),
            payload.text
        ),
        SwitchEvent::Terminal {
            outcome,
            occurred_at,
        } => match outcome {
            BroadcastOutcome::Sent { publication_id } => format!(
                "[terminal] broadcast sent at {} (publication {publication_id})",
                stamp(*occurred_at)
            ),
            BroadcastOutcome::Failed { error } => format!(
                "[terminal] broadcast FAILED at {}: {error}",
                stamp(*occurred_at)
            ),
        },
    }
}
