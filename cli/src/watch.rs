//! `vigil watch`: follow the switch live until it turns terminal.
//!
//! Pushed events are a latency optimization, never the source of truth, so
//! the loop reconciles with `switch.state` whenever the socket stays quiet
//! for a full interval. The terminal guard is applied to every event and
//! every poll response; the first terminal observation prints the banner
//! and ends the watch.

use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use vigil_protocol::Phase;
use vigil_protocol::StateView;
use vigil_protocol::SwitchEvent;
use vigil_protocol::methods::METHOD_SWITCH_STATE;
use vigil_protocol::methods::METHOD_SWITCH_SUBSCRIBE;
use vigil_protocol::methods::NOTIFY_SWITCH_EVENT;

use crate::WatchArgs;
use crate::client::IpcClient;
use crate::client::resolve_socket;
use crate::guard::TerminalGuard;
use crate::render;

pub fn run(args: &WatchArgs) -> Result<(), String> {
    let socket = resolve_socket(args.socket.as_deref())?;
    let mut client = IpcClient::connect(&socket)?;
    let mut guard = TerminalGuard::new();

    let initial = fetch_state(&mut client)?;
    println!("{}", render::state_block(&initial));
    guard.observe_state(&initial);
    if guard.is_terminal() {
        println!("{}", guard.banner());
        return Ok(());
    }
    let mut last_phase = initial.phase;

    client.call(METHOD_SWITCH_SUBSCRIBE, json!({}))?;
    let interval = args.interval.max(1);
    client.set_read_timeout(Some(Duration::from_secs(interval)))?;
    println!("watching (reconcile every {interval}s; ctrl-c to stop)");

    // At most one reconciliation request is in flight; its id pairs the
    // response back up with the poll that sent it.
    let mut pending_poll: Option<i64> = None;
    loop {
        match client.next_message()? {
            Some(message) => {
                handle_message(&message, &mut guard, &mut last_phase, &mut pending_poll);
            }
            None if pending_poll.is_none() => {
                pending_poll = Some(client.send_request(METHOD_SWITCH_STATE, json!({}))?);
            }
            None => {}
        }
        if guard.is_terminal() {
            println!("{}", guard.banner());
            return Ok(());
        }
    }
}

fn fetch_state(client: &mut IpcClient) -> Result<StateView, String> {
    let raw = client.call(METHOD_SWITCH_STATE, json!({}))?;
    serde_json::from_value(raw).map_err(|e| format!("unexpected switch.state shape: {e}"))
}

fn handle_message(
    message: &Value,
    guard: &mut TerminalGuard,
    last_phase: &mut Phase,
    pending_poll: &mut Option<i64>,
) {
    if message.get("method").and_then(Value::as_str) == Some(NOTIFY_SWITCH_EVENT) {
        let Some(params) = message.get("params") else {
            return;
        };
        // An event shape this build does not know is skipped; the next
        // reconciliation poll catches the client up.
        if let Ok(event) = serde_json::from_value::<SwitchEvent>(params.clone()) {
            println!("{}", render::event_line(&event));
            guard.observe_event(&event);
            *last_phase = match &event {
                SwitchEvent::Reset { .. } => Phase::Active,
                SwitchEvent::GraceStarted { .. } => Phase::GracePending,
                SwitchEvent::Terminal { .. } => Phase::Terminal,
            };
        }
        return;
    }
    if let (Some(id), Some(expected)) = (message.get("id").and_then(Value::as_i64), *pending_poll)
        && id == expected
    {
        *pending_poll = None;
        if message.get("error").is_some() {
            return;
        }
        let Some(result) = message.get("result") else {
            return;
        };
        if let Ok(state) = serde_json::from_value::<StateView>(result.clone()) {
            guard.observe_state(&state);
            if state.phase != *last_phase {
                println!("[reconciled] phase is now {}", state.phase.as_str());
                *last_phase = state.phase;
            }
        }
    }
}
