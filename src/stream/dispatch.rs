//! Event delivery to the caller.
//!
//! Every observable lifecycle event goes through [`TickerListener`]. Callers
//! either implement the trait, register closures on [`Callbacks`], or consume
//! [`TickerEvent`]s from a [`ChannelListener`]. Delivery is synchronous and
//! fire-and-forget; listeners should not block.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::stream::error::TickerError;
use crate::stream::proto::TickRecord;

/// Receiver of stream lifecycle events. Every method defaults to a no-op.
pub trait TickerListener: Send + Sync {
    /// Session authenticated and ready for subscribe frames.
    fn on_connect(&self) {}

    /// Decoded, non-empty tick frame.
    fn on_message(&self, _ticks: &[TickRecord]) {}

    fn on_error(&self, _error: &TickerError) {}

    /// Peer sent a close frame.
    fn on_close(&self, _code: u16, _reason: &str) {}

    /// A reconnect attempt will be made after `delay`.
    fn on_reconnect(&self, _attempt: u32, _delay: Duration) {}

    /// Attempts are exhausted and the stream stopped for good.
    fn on_no_reconnect(&self, _attempt: u32) {}
}

/// Listener that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListener;

impl TickerListener for NoopListener {}

type ConnectFn = Box<dyn Fn() + Send + Sync>;
type MessageFn = Box<dyn Fn(&[TickRecord]) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&TickerError) + Send + Sync>;
type CloseFn = Box<dyn Fn(u16, &str) + Send + Sync>;
type ReconnectFn = Box<dyn Fn(u32, Duration) + Send + Sync>;
type NoReconnectFn = Box<dyn Fn(u32) + Send + Sync>;

/// Closure slots, at most one per event kind. Unset slots are no-ops.
#[derive(Default)]
pub struct Callbacks {
    on_connect: Option<ConnectFn>,
    on_message: Option<MessageFn>,
    on_error: Option<ErrorFn>,
    on_close: Option<CloseFn>,
    on_reconnect: Option<ReconnectFn>,
    on_no_reconnect: Option<NoReconnectFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    pub fn with_message(mut self, f: impl Fn(&[TickRecord]) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn with_error(mut self, f: impl Fn(&TickerError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn with_close(mut self, f: impl Fn(u16, &str) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    pub fn with_reconnect(mut self, f: impl Fn(u32, Duration) + Send + Sync + 'static) -> Self {
        self.on_reconnect = Some(Box::new(f));
        self
    }

    pub fn with_no_reconnect(mut self, f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_no_reconnect = Some(Box::new(f));
        self
    }
}

impl TickerListener for Callbacks {
    fn on_connect(&self) {
        if let Some(f) = &self.on_connect {
            f();
        }
    }

    fn on_message(&self, ticks: &[TickRecord]) {
        if let Some(f) = &self.on_message {
            f(ticks);
        }
    }

    fn on_error(&self, error: &TickerError) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }

    fn on_close(&self, code: u16, reason: &str) {
        if let Some(f) = &self.on_close {
            f(code, reason);
        }
    }

    fn on_reconnect(&self, attempt: u32, delay: Duration) {
        if let Some(f) = &self.on_reconnect {
            f(attempt, delay);
        }
    }

    fn on_no_reconnect(&self, attempt: u32) {
        if let Some(f) = &self.on_no_reconnect {
            f(attempt);
        }
    }
}

/// Owned copy of a listener event.
#[derive(Clone, Debug, PartialEq)]
pub enum TickerEvent {
    Connected,
    Message(Vec<TickRecord>),
    /// Rendered error; see the error callback for the typed value.
    Error(String),
    Closed { code: u16, reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    GaveUp { attempt: u32 },
}

/// Listener that forwards every event into an unbounded channel.
#[derive(Clone, Debug)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<TickerEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TickerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: TickerEvent) {
        // Dropped receiver means the caller stopped listening.
        let _ = self.tx.send(event);
    }
}

impl TickerListener for ChannelListener {
    fn on_connect(&self) {
        self.emit(TickerEvent::Connected);
    }

    fn on_message(&self, ticks: &[TickRecord]) {
        self.emit(TickerEvent::Message(ticks.to_vec()));
    }

    fn on_error(&self, error: &TickerError) {
        self.emit(TickerEvent::Error(error.to_string()));
    }

    fn on_close(&self, code: u16, reason: &str) {
        self.emit(TickerEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    fn on_reconnect(&self, attempt: u32, delay: Duration) {
        self.emit(TickerEvent::Reconnecting { attempt, delay });
    }

    fn on_no_reconnect(&self, attempt: u32) {
        self.emit(TickerEvent::GaveUp { attempt });
    }
}
