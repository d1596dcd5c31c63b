//! Operator console for the vigil switch service.
//!
//! A thin blocking IPC client over the daemon's Unix socket. Every command
//! opens one connection, runs the protocol handshake, does its work, and
//! exits; `watch` keeps the connection open and streams pushed events.
//! Mutating commands route through the terminal guard so a client that has
//! seen the switch go terminal stops sending mutations at all.

mod client;
mod guard;
mod render;
mod watch;

use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use serde_json::Value;
use serde_json::json;
use vigil_protocol::LedgerEntry;
use vigil_protocol::StateView;
use vigil_protocol::methods::METHOD_AUTH_LOGIN;
use vigil_protocol::methods::METHOD_SERVICE_STATUS;
use vigil_protocol::methods::METHOD_SWITCH_ARM;
use vigil_protocol::methods::METHOD_SWITCH_CLAIM;
use vigil_protocol::methods::METHOD_SWITCH_LEDGER;
use vigil_protocol::methods::METHOD_SWITCH_RESET;
use vigil_protocol::methods::METHOD_SWITCH_STATE;

use crate::client::IpcClient;
use crate::client::resolve_socket;
use crate::guard::TerminalGuard;

/// Session token fallback for `--token`.
const TOKEN_ENV_VAR: &str = "VIGIL_TOKEN";
/// Secret fallback for `login --secret`.
const SECRET_ENV_VAR: &str = "VIGIL_SECRET";
/// Service credential fallback for `claim --service-token`.
const SERVICE_TOKEN_ENV_VAR: &str = "VIGIL_SERVICE_TOKEN";

#[derive(Debug, Parser)]
#[command(
    name = "vigil",
    version,
    about = "Operator console for the vigil switch service"
)]
struct VigilCli {
    #[command(subcommand)]
    command: VigilSubcommand,
}

#[derive(Debug, Subcommand)]
enum VigilSubcommand {
    /// Authenticate and print a session token.
    Login(LoginArgs),
    /// Show the current switch state.
    Status(StatusArgs),
    /// Reset the primary countdown.
    Reset(ResetArgs),
    /// Arm the grace countdown on a lapsed switch.
    Arm(ArmArgs),
    /// List recent ledger entries, newest first.
    Ledger(LedgerArgs),
    /// Stream switch events until the switch turns terminal.
    Watch(WatchArgs),
    /// Run one claim-and-publish pass (for external schedulers).
    Claim(ClaimArgs),
    /// Show daemon health.
    ServiceStatus(ServiceStatusArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Argument types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
struct LoginArgs {
    /// Operator identity.
    #[arg(long = "identity", short = 'i')]
    identity: String,

    /// Operator secret; falls back to $VIGIL_SECRET.
    #[arg(long = "secret")]
    secret: Option<String>,

    /// Free-form location note recorded in the ledger.
    #[arg(long = "location")]
    location: Option<String>,

    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    json: bool,

    /// Override socket path.
    #[arg(long = "socket")]
    socket: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    json: bool,

    /// Override socket path.
    #[arg(long = "socket")]
    socket: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ResetArgs {
    /// Session token; falls back to $VIGIL_TOKEN.
    #[arg(long = "token")]
    token: Option<String>,

    /// Why this reset happened, for the ledger.
    #[arg(long = "reason")]
    reason: Option<String>,

    /// Free-form location note recorded in the ledger.
    #[arg(long = "location")]
    location: Option<String>,

    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    json: bool,

    /// Override socket path.
    #[arg(long = "socket")]
    socket: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ArmArgs {
    /// Session token; falls back to $VIGIL_TOKEN.
    #[arg(long = "token")]
    token: Option<String>,

    /// Free-form location note recorded in the ledger.
    #[arg(long = "location")]
    location: Option<String>,

    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    json: bool,

    /// Override socket path.
    #[arg(long = "socket")]
    socket: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct LedgerArgs {
    /// Maximum entries to show.
    #[arg(long = "limit", short = 'n', default_value = "20")]
    limit: u32,

    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    json: bool,

    /// Override socket path.
    #[arg(long = "socket")]
    socket: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct WatchArgs {
    /// Seconds between reconciliation polls while the socket is quiet.
    #[arg(long = "interval", default_value = "5")]
    pub interval: u64,

    /// Override socket path.
    #[arg(long = "socket")]
    pub socket: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ClaimArgs {
    /// Shared service credential; falls back to $VIGIL_SERVICE_TOKEN.
    #[arg(long = "service-token")]
    service_token: Option<String>,

    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    json: bool,

    /// Override socket path.
    #[arg(long = "socket")]
    socket: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ServiceStatusArgs {
    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    json: bool,

    /// Override socket path.
    #[arg(long = "socket")]
    socket: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = VigilCli::parse();
    let result = match &cli.command {
        VigilSubcommand::Login(args) => cmd_login(args),
        VigilSubcommand::Status(args) => cmd_status(args),
        VigilSubcommand::Reset(args) => cmd_reset(args),
        VigilSubcommand::Arm(args) => cmd_arm(args),
        VigilSubcommand::Ledger(args) => cmd_ledger(args),
        VigilSubcommand::Watch(args) => watch::run(args),
        VigilSubcommand::Claim(args) => cmd_claim(args),
        VigilSubcommand::ServiceStatus(args) => cmd_service_status(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared plumbing
// ─────────────────────────────────────────────────────────────────────────────

fn connect(socket: Option<&Path>) -> Result<IpcClient, String> {
    let path = resolve_socket(socket)?;
    Ok(IpcClient::connect(&path)?)
}

fn fetch_state(client: &mut IpcClient) -> Result<(StateView, Value), String> {
    let raw = client.call(METHOD_SWITCH_STATE, json!({}))?;
    let state = serde_json::from_value(raw.clone())
        .map_err(|e| format!("unexpected switch.state shape: {e}"))?;
    Ok((state, raw))
}

fn resolve_token(explicit: Option<&str>) -> Result<String, String> {
    if let Some(token) = explicit {
        return Ok(token.to_string());
    }
    match std::env::var(TOKEN_ENV_VAR) {
        Ok(token) if !token.is_empty() => Ok(token),
        _ => Err(format!(
            "no session token; run `vigil login` and export {TOKEN_ENV_VAR}"
        )),
    }
}

fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    );
}

/// Run a mutating call through the guard: pre-flight the current state, and
/// if the service still answers frozen, latch and show the banner.
fn guarded_call(
    client: &mut IpcClient,
    action: &str,
    method: &str,
    params: Value,
) -> Result<Value, String> {
    let (state, _) = fetch_state(client)?;
    let mut guard = TerminalGuard::new();
    guard.observe_state(&state);
    if let Err(refusal) = guard.check_mutation(action) {
        decorate_from_ledger(client, &mut guard);
        println!("{}", guard.banner());
        return Err(refusal);
    }
    match client.call(method, params) {
        Ok(result) => Ok(result),
        Err(err) => {
            guard.observe_error_code(err.code);
            if guard.is_terminal() {
                decorate_from_ledger(client, &mut guard);
                println!("{}", guard.banner());
                return Err(format!("{action} refused: {}", err.message));
            }
            Err(err.to_string())
        }
    }
}

/// Best-effort lookup of the broadcast outcome for the banner; the ledger
/// holds it once the terminal event itself is long gone.
fn decorate_from_ledger(client: &mut IpcClient, guard: &mut TerminalGuard) {
    let Ok(result) = client.call(METHOD_SWITCH_LEDGER, json!({ "limit": 10 })) else {
        return;
    };
    let Some(entries) = result.get("entries").and_then(Value::as_array) else {
        return;
    };
    for entry in entries {
        if let Ok(entry) = serde_json::from_value::<LedgerEntry>(entry.clone()) {
            guard.observe_ledger_entry(&entry);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_login(args: &LoginArgs) -> Result<(), String> {
    let secret = match &args.secret {
        Some(secret) => secret.clone(),
        None => std::env::var(SECRET_ENV_VAR)
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("no secret given; pass --secret or set {SECRET_ENV_VAR}"))?,
    };
    let mut client = connect(args.socket.as_deref())?;
    let mut params = json!({ "identity": args.identity, "secret": secret });
    if let Some(location) = &args.location {
        params["location"] = Value::String(location.clone());
    }
    let result = client.call(METHOD_AUTH_LOGIN, params)?;

    if args.json {
        print_json(&result);
        return Ok(());
    }
    let token = result.get("token").and_then(Value::as_str).unwrap_or("?");
    let expires = result
        .get("expires_at")
        .and_then(Value::as_str)
        .unwrap_or("?");
    println!("Logged in as {} (session expires {expires})", args.identity);
    println!("export {TOKEN_ENV_VAR}={token}");
    Ok(())
}

fn cmd_status(args: &StatusArgs) -> Result<(), String> {
    let mut client = connect(args.socket.as_deref())?;
    let (state, raw) = fetch_state(&mut client)?;
    if args.json {
        print_json(&raw);
        return Ok(());
    }
    println!("{}", render::state_block(&state));
    let mut guard = TerminalGuard::new();
    guard.observe_state(&state);
    if guard.is_terminal() {
        decorate_from_ledger(&mut client, &mut guard);
        println!("{}", guard.banner());
    }
    Ok(())
}

fn cmd_reset(args: &ResetArgs) -> Result<(), String> {
    let token = resolve_token(args.token.as_deref())?;
    let mut client = connect(args.socket.as_deref())?;
    let mut params = json!({ "token": token });
    if let Some(reason) = &args.reason {
        params["reason"] = Value::String(reason.clone());
    }
    if let Some(location) = &args.location {
        params["location"] = Value::String(location.clone());
    }
    let result = guarded_call(&mut client, "reset", METHOD_SWITCH_RESET, params)?;

    if args.json {
        print_json(&result);
        return Ok(());
    }
    println!(
        "Reset recorded; next expiry {} (resets: {} total, {} in the last 24h)",
        result
            .get("target_expiry")
            .and_then(Value::as_str)
            .unwrap_or("?"),
        result
            .pointer("/counters/total")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        result
            .pointer("/counters/last_24h")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    );
    Ok(())
}

fn cmd_arm(args: &ArmArgs) -> Result<(), String> {
    let token = resolve_token(args.token.as_deref())?;
    let mut client = connect(args.socket.as_deref())?;
    let mut params = json!({ "token": token });
    if let Some(location) = &args.location {
        params["location"] = Value::String(location.clone());
    }
    let result = guarded_call(&mut client, "arm", METHOD_SWITCH_ARM, params)?;

    if args.json {
        print_json(&result);
        return Ok(());
    }
    println!(
        "Grace cycle armed; fires at {} unless the switch is reset first",
        result
            .get("trigger_at")
            .and_then(Value::as_str)
            .unwrap_or("?"),
    );
    println!(
        "Payload: \"{}\"",
        result
            .pointer("/payload/text")
            .and_then(Value::as_str)
            .unwrap_or("?"),
    );
    Ok(())
}

fn cmd_ledger(args: &LedgerArgs) -> Result<(), String> {
    let mut client = connect(args.socket.as_deref())?;
    let result = client.call(METHOD_SWITCH_LEDGER, json!({ "limit": args.limit }))?;

    if args.json {
        print_json(&result);
        return Ok(());
    }
    let entries = result
        .get("entries")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if entries.is_empty() {
        println!("Ledger is empty.");
        return Ok(());
    }
    let mut guard = TerminalGuard::new();
    for raw in &entries {
        match serde_json::from_value::<LedgerEntry>(raw.clone()) {
            Ok(entry) => {
                guard.observe_ledger_entry(&entry);
                println!("{}", render::ledger_line(&entry));
            }
            Err(_) => println!("{raw}"),
        }
    }
    if guard.is_terminal() {
        println!("{}", guard.banner());
    }
    Ok(())
}

fn cmd_claim(args: &ClaimArgs) -> Result<(), String> {
    let service_token = match &args.service_token {
        Some(token) => token.clone(),
        None => std::env::var(SERVICE_TOKEN_ENV_VAR)
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                format!("no service credential; pass --service-token or set {SERVICE_TOKEN_ENV_VAR}")
            })?,
    };
    let mut client = connect(args.socket.as_deref())?;
    let result = client.call(METHOD_SWITCH_CLAIM, json!({ "service_token": service_token }))?;

    if args.json {
        print_json(&result);
        return Ok(());
    }
    if !result.get("claimed").and_then(Value::as_bool).unwrap_or(false) {
        println!("Nothing to claim.");
        return Ok(());
    }
    match result.pointer("/outcome/status").and_then(Value::as_str) {
        Some("sent") => println!(
            "Claimed; broadcast sent (publication {})",
            result
                .pointer("/outcome/publication_id")
                .and_then(Value::as_str)
                .unwrap_or("?"),
        ),
        Some("failed") => println!(
            "Claimed; broadcast FAILED: {}",
            result
                .pointer("/outcome/error")
                .and_then(Value::as_str)
                .unwrap_or("?"),
        ),
        _ => println!("Claimed."),
    }
    Ok(())
}

fn cmd_service_status(args: &ServiceStatusArgs) -> Result<(), String> {
    let mut client = connect(args.socket.as_deref())?;
    let result = client.call(METHOD_SERVICE_STATUS, json!({}))?;

    if args.json {
        print_json(&result);
        return Ok(());
    }
    println!(
        "vigil service: up {}, phase {}, polling every {}s, {} ledger entries",
        render::human_duration(
            result
                .get("uptime_s")
                .and_then(Value::as_i64)
                .unwrap_or(0)
        ),
        result.get("phase").and_then(Value::as_str).unwrap_or("?"),
        result
            .get("poll_interval_s")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        result
            .get("ledger_len")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        VigilCli::command().debug_assert();
    }

    #[test]
    fn explicit_token_beats_the_environment() {
        assert_eq!(resolve_token(Some("tok-1")).unwrap(), "tok-1");
    }
}
