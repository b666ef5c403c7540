//! Realtime stream modules.
//!
//! - `client`: handshake-then-connect lifecycle, receive loop, and sends.
//! - `proto`: event envelope shared with the stream service.
//! - `router`: type tag to handler registry used by the receive loop.

/// Session client owning the websocket connection.
pub mod client;
/// Stream protocol messages.
pub mod proto;
/// Event router and handler adapters.
pub mod router;
