//! Rust client for the SmartAPI market tick websocket.
//!
//! The crate is organized by concern:
//! - `stream`: authenticated, compressed tick stream with heartbeats,
//!   subscriptions and automatic reconnection.
//! - `retry`: reconnect policy and timeout helpers.

/// Reconnect policy and timeout helpers.
pub mod retry;
/// Tick stream client, protocol types and listeners.
pub mod stream;

pub use retry::ReconnectPolicy;
pub use stream::{
    Callbacks, ConnectionState, TickRecord, TickerClient, TickerError, TickerEvent,
    TickerHandle, TickerListener, TickerSender, TokenList,
};
