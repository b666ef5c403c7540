//! Rust SDK for realtime messaging sessions.
//!
//! The crate is organized by transport surface:
//! - `api`: HTTP client for the `rtm.start` handshake.
//! - `stream`: websocket session client, event envelope, and event routing.

/// Handshake API client and response types.
pub mod api;
/// Realtime session client, protocol types, and event router.
pub mod stream;
