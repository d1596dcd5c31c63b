//! Wire types for the vigil IPC protocol.
//!
//! The service speaks newline-delimited JSON-RPC-lite over a Unix domain
//! socket: requests carry `id`/`method`/`params`, responses carry `id` plus
//! either `result` or `error`, and server→client pushes are id-less
//! notifications. This crate defines the envelopes, the per-method
//! param/result structs, the shared switch state model, and the error codes.
//! No I/O lives here.

pub mod jsonrpc;
pub mod methods;
pub mod switch;

pub use jsonrpc::JsonRpcError;
pub use jsonrpc::JsonRpcNotification;
pub use jsonrpc::JsonRpcRequest;
pub use jsonrpc::JsonRpcResponse;
pub use jsonrpc::RequestId;
pub use methods::PROTOCOL_VERSION;
pub use switch::BroadcastOutcome;
pub use switch::BroadcastPayload;
pub use switch::GraceView;
pub use switch::LedgerEntry;
pub use switch::LedgerKind;
pub use switch::Phase;
pub use switch::ResetCounters;
pub use switch::StateView;
pub use switch::SwitchEvent;
