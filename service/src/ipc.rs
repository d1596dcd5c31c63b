//! Unix domain socket listener and request dispatch.
//!
//! One line on the socket is one JSON-RPC-lite message. Every connection
//! must open with `hello`; after `switch.subscribe`, accepted transitions
//! are pushed to it as `switch.event` notifications. Responses and pushes
//! share a per-connection writer task so lines never interleave.

use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vigil_core::SwitchError;
use vigil_protocol::JsonRpcError;
use vigil_protocol::JsonRpcNotification;
use vigil_protocol::JsonRpcRequest;
use vigil_protocol::JsonRpcResponse;
use vigil_protocol::RequestId;
use vigil_protocol::SwitchEvent;
use vigil_protocol::jsonrpc::ErrorBody;
use vigil_protocol::methods::ArmParams;
use vigil_protocol::methods::ClaimParams;
use vigil_protocol::methods::ClaimResult;
use vigil_protocol::methods::ERR_AUTH;
use vigil_protocol::methods::ERR_FROZEN;
use vigil_protocol::methods::ERR_INFRA;
use vigil_protocol::methods::ERR_INVALID_PARAMS;
use vigil_protocol::methods::ERR_INVALID_REQUEST;
use vigil_protocol::methods::ERR_METHOD_NOT_FOUND;
use vigil_protocol::methods::ERR_PRECONDITION;
use vigil_protocol::methods::ERR_PUBLISH;
use vigil_protocol::methods::ERR_STORAGE;
use vigil_protocol::methods::HelloParams;
use vigil_protocol::methods::HelloResult;
use vigil_protocol::methods::LedgerParams;
use vigil_protocol::methods::LedgerResult;
use vigil_protocol::methods::LoginParams;
use vigil_protocol::methods::LoginResult;
use vigil_protocol::methods::METHOD_AUTH_LOGIN;
use vigil_protocol::methods::METHOD_HELLO;
use vigil_protocol::methods::METHOD_SERVICE_STATUS;
use vigil_protocol::methods::METHOD_SWITCH_ARM;
use vigil_protocol::methods::METHOD_SWITCH_CLAIM;
use vigil_protocol::methods::METHOD_SWITCH_LEDGER;
use vigil_protocol::methods::METHOD_SWITCH_RESET;
use vigil_protocol::methods::METHOD_SWITCH_STATE;
use vigil_protocol::methods::METHOD_SWITCH_SUBSCRIBE;
use vigil_protocol::methods::NOTIFY_SWITCH_EVENT;
use vigil_protocol::methods::PROTOCOL_VERSION;
use vigil_protocol::methods::ResetParams;
use vigil_protocol::methods::ServiceStatusResult;
use vigil_protocol::methods::SubscribeResult;

use crate::Daemon;

const LEDGER_DEFAULT_LIMIT: u32 = 50;
const LEDGER_MAX_LIMIT: u32 = 500;

const CAPABILITIES: &[&str] = &[
    METHOD_AUTH_LOGIN,
    METHOD_SWITCH_STATE,
    METHOD_SWITCH_RESET,
    METHOD_SWITCH_ARM,
    METHOD_SWITCH_CLAIM,
    METHOD_SWITCH_LEDGER,
    METHOD_SWITCH_SUBSCRIBE,
    METHOD_SERVICE_STATUS,
];

/// Bind the listener socket, clearing a stale file from a previous run.
pub fn bind_listener(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    UnixListener::bind(path)
}

/// Accept loop. Runs until `shutdown` flips to true or the sender is gone.
pub async fn serve(
    daemon: Arc<Daemon>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let daemon = Arc::clone(&daemon);
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(daemon, stream).await {
                                tracing::warn!("connection error: {err}");
                            }
                        });
                    }
                    Err(err) => tracing::error!("accept failed: {err}"),
                }
            }
        }
    }
    tracing::info!("listener stopped");
    Ok(())
}

/// What the connection has established so far. `greeted` gates every method
/// other than `hello`; `subscribed` is flipped at most once.
#[derive(Default)]
struct ConnState {
    greeted: bool,
    subscribed: bool,
}

async fn handle_connection(daemon: Arc<Daemon>, stream: UnixStream) -> io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut conn = ConnState::default();
    let mut forwarder: Option<JoinHandle<()>> = None;
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }
        let was_subscribed = conn.subscribed;
        let response = dispatch_message(&daemon, &mut conn, raw).await;
        // Subscribe to the bus before the response goes out so no event
        // emitted after the client reads its ack can be missed.
        if conn.subscribed && !was_subscribed {
            forwarder = Some(spawn_event_forwarder(
                daemon.switch.subscribe_events(),
                out_tx.clone(),
            ));
        }
        if out_tx.send(encode_line(&response)).is_err() {
            break;
        }
    }

    if let Some(task) = forwarder {
        task.abort();
    }
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Pump switch events into the connection's writer as notifications. Exits
/// when the connection or the bus goes away; lagged events are dropped and
/// the client reconciles by polling.
fn spawn_event_forwarder(
    mut events: broadcast::Receiver<SwitchEvent>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Ok(params) = serde_json::to_value(&event) else {
                        continue;
                    };
                    let notification = JsonRpcNotification {
                        method: NOTIFY_SWITCH_EVENT.to_string(),
                        params: Some(params),
                    };
                    let Ok(encoded) = serde_json::to_value(&notification) else {
                        continue;
                    };
                    if out_tx.send(encode_line(&encoded)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn encode_line(value: &serde_json::Value) -> Vec<u8> {
    let mut bytes = value.to_string().into_bytes();
    bytes.push(b'\n');
    bytes
}

async fn dispatch_message(
    daemon: &Daemon,
    conn: &mut ConnState,
    raw: &str,
) -> serde_json::Value {
    let request: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(request) => request,
        Err(err) => {
            return error_envelope(
                RequestId::default(),
                ERR_INVALID_REQUEST,
                format!("invalid request: {err}"),
            );
        }
    };
    let id = request.id.clone();
    if !conn.greeted && request.method != METHOD_HELLO {
        return error_envelope(
            id,
            ERR_INVALID_REQUEST,
            format!("hello handshake required before {}", request.method),
        );
    }
    tracing::debug!(method = %request.method, "dispatch");
    match dispatch_method(daemon, conn, &request.method, request.params).await {
        Ok(result) => response_envelope(id, result),
        Err((code, message)) => error_envelope(id, code, message),
    }
}

async fn dispatch_method(
    daemon: &Daemon,
    conn: &mut ConnState,
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    match method {
        METHOD_HELLO => handle_hello(conn, params),
        METHOD_AUTH_LOGIN => handle_login(daemon, params),
        METHOD_SWITCH_STATE => handle_state(daemon),
        METHOD_SWITCH_RESET => handle_reset(daemon, params),
        METHOD_SWITCH_ARM => handle_arm(daemon, params),
        METHOD_SWITCH_CLAIM => handle_claim(daemon, params).await,
        METHOD_SWITCH_LEDGER => handle_ledger(daemon, params),
        METHOD_SWITCH_SUBSCRIBE => handle_subscribe(conn),
        METHOD_SERVICE_STATUS => handle_status(daemon),
        other => Err((ERR_METHOD_NOT_FOUND, format!("unknown method: {other}"))),
    }
}

fn handle_hello(
    conn: &mut ConnState,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    let hello: HelloParams = parse_params(METHOD_HELLO, params)?;
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err((
            ERR_INVALID_REQUEST,
            format!(
                "incompatible protocol version {} (service speaks {PROTOCOL_VERSION})",
                hello.protocol_version
            ),
        ));
    }
    conn.greeted = true;
    to_result(HelloResult {
        protocol_version: PROTOCOL_VERSION,
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: CAPABILITIES.iter().map(|m| (*m).to_string()).collect(),
    })
}

fn handle_login(
    daemon: &Daemon,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    let params: LoginParams = parse_params(METHOD_AUTH_LOGIN, params)?;
    let now = Utc::now();
    let session = daemon
        .sessions
        .authenticate(&params.identity, &params.secret, now)
        .map_err(rpc_err)?;
    // The audit entry must not block the login itself.
    if let Err(err) = daemon
        .switch
        .record_login(&session.identity, params.location, now)
    {
        tracing::warn!(error = %err, "failed to record login in ledger");
    }
    to_result(LoginResult {
        token: session.token,
        identity: session.identity,
        expires_at: session.expires_at,
    })
}

fn handle_state(daemon: &Daemon) -> Result<serde_json::Value, (i64, String)> {
    let view = daemon.switch.state(Utc::now()).map_err(rpc_err)?;
    to_result(view)
}

fn handle_reset(
    daemon: &Daemon,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    let params: ResetParams = parse_params(METHOD_SWITCH_RESET, params)?;
    let now = Utc::now();
    let actor = daemon.sessions.verify(&params.token, now).map_err(rpc_err)?;
    let result = daemon
        .switch
        .reset(&actor, params.reason, params.location, now)
        .map_err(rpc_err)?;
    to_result(result)
}

fn handle_arm(
    daemon: &Daemon,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    let params: ArmParams = parse_params(METHOD_SWITCH_ARM, params)?;
    let now = Utc::now();
    let actor = daemon.sessions.verify(&params.token, now).map_err(rpc_err)?;
    let result = daemon
        .switch
        .start_grace(&actor, params.location, now)
        .map_err(rpc_err)?;
    to_result(result)
}

async fn handle_claim(
    daemon: &Daemon,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    let params: ClaimParams = parse_params(METHOD_SWITCH_CLAIM, params)?;
    daemon
        .sessions
        .verify_service(&params.service_token)
        .map_err(rpc_err)?;
    let outcome = daemon
        .switch
        .claim_and_publish(Utc::now())
        .await
        .map_err(rpc_err)?;
    to_result(ClaimResult {
        claimed: outcome.is_some(),
        outcome,
    })
}

fn handle_ledger(
    daemon: &Daemon,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    let params: LedgerParams = parse_optional_params(METHOD_SWITCH_LEDGER, params)?;
    let limit = params
        .limit
        .unwrap_or(LEDGER_DEFAULT_LIMIT)
        .min(LEDGER_MAX_LIMIT);
    let entries = daemon.switch.recent_ledger(limit).map_err(rpc_err)?;
    to_result(LedgerResult { entries })
}

fn handle_subscribe(conn: &mut ConnState) -> Result<serde_json::Value, (i64, String)> {
    conn.subscribed = true;
    to_result(SubscribeResult { subscribed: true })
}

fn handle_status(daemon: &Daemon) -> Result<serde_json::Value, (i64, String)> {
    let view = daemon.switch.state(Utc::now()).map_err(rpc_err)?;
    to_result(ServiceStatusResult {
        uptime_s: daemon.uptime_s(),
        phase: view.phase,
        terminal: view.terminal,
        poll_interval_s: daemon.poll_interval_s,
        ledger_len: daemon.switch.ledger_len().map_err(rpc_err)?,
    })
}

fn parse_params<T: DeserializeOwned>(
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<T, (i64, String)> {
    let params = params.ok_or_else(|| {
        (
            ERR_INVALID_PARAMS,
            format!("{method}: params are required"),
        )
    })?;
    serde_json::from_value(params)
        .map_err(|err| (ERR_INVALID_PARAMS, format!("{method}: invalid params: {err}")))
}

fn parse_optional_params<T: DeserializeOwned + Default>(
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<T, (i64, String)> {
    match params {
        None => Ok(T::default()),
        Some(value) => serde_json::from_value(value)
            .map_err(|err| (ERR_INVALID_PARAMS, format!("{method}: invalid params: {err}"))),
    }
}

fn to_result<T: Serialize>(value: T) -> Result<serde_json::Value, (i64, String)> {
    serde_json::to_value(value)
        .map_err(|err| (ERR_INFRA, format!("failed to encode result: {err}")))
}

fn rpc_err(err: SwitchError) -> (i64, String) {
    let code = match &err {
        SwitchError::Frozen => ERR_FROZEN,
        SwitchError::Precondition { .. } => ERR_PRECONDITION,
        SwitchError::Storage { .. } => ERR_STORAGE,
        SwitchError::Publish { .. } => ERR_PUBLISH,
        SwitchError::Auth { .. } => ERR_AUTH,
        SwitchError::Config { .. } => ERR_INFRA,
    };
    (code, err.to_string())
}

fn response_envelope(id: RequestId, result: serde_json::Value) -> serde_json::Value {
    serde_json::to_value(JsonRpcResponse { id, result }).unwrap_or_else(|_| {
        serde_json::json!({
            "id": 0,
            "error": { "code": ERR_INFRA, "message": "failed to encode response" },
        })
    })
}

fn error_envelope(id: RequestId, code: i64, message: impl Into<String>) -> serde_json::Value {
    let envelope = JsonRpcError {
        id,
        error: ErrorBody {
            code,
            message: message.into(),
            data: None,
        },
    };
    serde_json::to_value(envelope).unwrap_or_else(|_| {
        serde_json::json!({
            "id": 0,
            "error": { "code": ERR_INFRA, "message": "failed to encode error" },
        })
    })
}
