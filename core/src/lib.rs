//! Domain core of the vigil dead-man's switch.
//!
//! Everything that decides or persists switch state lives here: the two
//! timer singletons and the append-only ledger (`store`), phase derivation
//! and the transition aggregate (`machine`), the background expiration
//! poller (`poller`), the broadcast gateway (`gateway`), the session broker
//! (`auth`), and the fan-out bus (`events`). Transport lives in
//! `vigil-service`; this crate never touches a socket.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod machine;
pub mod poller;
pub mod store;

pub use error::Result;
pub use error::SwitchError;
pub use machine::SwitchService;
