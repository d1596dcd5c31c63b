//! Blocking JSON-RPC-lite client for the service socket.
//!
//! One `IpcClient` is one connection; the protocol handshake runs inside
//! `connect` so every client the rest of the CLI sees is already greeted.

use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use vigil_core::config::VigilConfig;
use vigil_protocol::PROTOCOL_VERSION;
use vigil_protocol::methods::METHOD_HELLO;

/// A failed request. `code` is `Some` when the service answered with an
/// error and `None` for local transport trouble, so callers can branch on
/// domain codes such as [`vigil_protocol::methods::ERR_FROZEN`].
#[derive(Debug)]
pub struct RpcError {
    pub code: Option<i64>,
    pub message: String,
}

impl RpcError {
    fn transport(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

// Command handlers report plain strings; `?` does the conversion.
impl From<RpcError> for String {
    fn from(err: RpcError) -> Self {
        err.to_string()
    }
}

pub struct IpcClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    next_id: i64,
}

impl IpcClient {
    pub fn connect(socket: &Path) -> Result<Self, RpcError> {
        let stream = UnixStream::connect(socket).map_err(|e| {
            RpcError::transport(format!(
                "cannot reach the vigil service at {}: {e}\nHint: start it with: vigil-service",
                socket.display()
            ))
        })?;
        let writer = stream
            .try_clone()
            .map_err(|e| RpcError::transport(format!("clone socket handle: {e}")))?;
        let mut client = Self {
            reader: BufReader::new(stream),
            writer,
            next_id: 0,
        };
        client.call(
            METHOD_HELLO,
            json!({
                "protocol_version": PROTOCOL_VERSION,
                "client_version": env!("CARGO_PKG_VERSION"),
            }),
        )?;
        Ok(client)
    }

    /// Send `method` and block until its response arrives. Pushed
    /// notifications encountered on the way are skipped; `watch` reads those
    /// through [`IpcClient::next_message`] instead.
    pub fn call(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.send_request(method, params)?;
        loop {
            let Some(message) = self.next_message()? else {
                return Err(RpcError::transport(format!(
                    "timed out waiting for the {method} response"
                )));
            };
            if message.get("method").is_some() {
                continue;
            }
            if message.get("id").and_then(Value::as_i64) != Some(id) {
                continue;
            }
            return Self::unpack(message);
        }
    }

    /// Fire a request without waiting for the response. The caller pairs the
    /// returned id against a later [`IpcClient::next_message`].
    pub fn send_request(&mut self, method: &str, params: Value) -> Result<i64, RpcError> {
        self.next_id += 1;
        let id = self.next_id;
        let mut line = json!({ "id": id, "method": method, "params": params }).to_string();
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .map_err(|e| RpcError::transport(format!("send {method}: {e}")))?;
        Ok(id)
    }

    /// Read one message off the wire. `Ok(None)` means the read timeout set
    /// via [`IpcClient::set_read_timeout`] lapsed while the socket was idle.
    pub fn next_message(&mut self) -> Result<Option<Value>, RpcError> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Err(RpcError::transport("the service closed the connection")),
            Ok(_) => serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| RpcError::transport(format!("malformed frame from the service: {e}"))),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(RpcError::transport(format!("read from service: {e}"))),
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.reader
            .get_ref()
            .set_read_timeout(timeout)
            .map_err(|e| RpcError::transport(format!("set read timeout: {e}")))
    }

    fn unpack(message: Value) -> Result<Value, RpcError> {
        if let Some(error) = message.get("error") {
            return Err(RpcError {
                code: error.get("code").and_then(Value::as_i64),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown service error")
                    .to_string(),
            });
        }
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// The explicit flag wins; otherwise use the socket path the daemon's own
/// configuration would pick, so both sides agree by default.
pub fn resolve_socket(explicit: Option<&Path>) -> Result<PathBuf, String> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    VigilConfig::load(None)
        .map(|config| config.service.socket_path)
        .map_err(|err| format!("failed to load configuration: {err}"))
}
