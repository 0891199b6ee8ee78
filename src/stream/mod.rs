//! Tick stream modules.
//!
//! - `client`: public builder, caller handle and spawned task handle.
//! - `proto`: control frames and the compressed tick frame codec.
//! - `subscription`: token list and `mw` subscribe frames.
//! - `dispatch`: listener trait, closure callbacks and channel listener.
//! - `session`: dialing, the `cn` handshake and the serialized writer.
//! - `heartbeat`, `reader`: per-session background tasks.
//! - `scheduler`: connect, backoff and reconnect loop.

/// Public stream client and handles.
pub mod client;
/// Listener trait and ready-made listeners.
pub mod dispatch;
/// Stream error type.
pub mod error;
mod heartbeat;
/// Wire frames and codec.
pub mod proto;
mod reader;
mod scheduler;
mod session;
/// Token lists and subscription state.
pub mod subscription;

pub use client::{ConnectionState, TickerClient, TickerHandle, TickerSender, TICKER_ENDPOINT};
pub use dispatch::{Callbacks, ChannelListener, NoopListener, TickerEvent, TickerListener};
pub use error::TickerError;
pub use proto::{decode_frame, encode_frame, Credentials, DecodeError, TickRecord};
pub use subscription::TokenList;
