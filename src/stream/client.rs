//! Public entry point for the tick stream.
//!
//! [`TickerClient`] collects credentials, endpoint, reconnect policy and a
//! listener, then runs the reconnecting scheduler either in place
//! ([`TickerClient::serve`]) or on its own task ([`TickerClient::spawn`]).
//! [`TickerSender`] is the cloneable caller-side handle used to subscribe,
//! rotate the feed token, observe state and stop the stream.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::retry::ReconnectPolicy;
use crate::stream::dispatch::{Callbacks, NoopListener, TickerListener};
use crate::stream::error::TickerError;
use crate::stream::proto::Credentials;
use crate::stream::scheduler::Scheduler;
pub use crate::stream::scheduler::ConnectionState;
use crate::stream::session::{ActiveSession, SharedCredentials, WsDialer};
use crate::stream::subscription::{SubscriptionRegistry, TokenList};

/// Production websocket endpoint for the tick stream.
pub const TICKER_ENDPOINT: &str = "wss://omnefeeds.angelbroking.com/NestHtml5Mobile/socket/stream";

/// Entry point for creating a tick stream.
pub struct TickerClient {
    endpoint: String,
    accept_invalid_certs: bool,
    credentials: SharedCredentials,
    policy: ReconnectPolicy,
    registry: SubscriptionRegistry,
    listener: Arc<dyn TickerListener>,
    active: ActiveSession,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl TickerClient {
    /// Creates a client for the production endpoint.
    ///
    /// `client_code` and `feed_token` come from the session API login.
    pub fn new(
        client_code: impl Into<String>,
        feed_token: SecretString,
        tokens: impl Into<TokenList>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            endpoint: TICKER_ENDPOINT.to_string(),
            accept_invalid_certs: false,
            credentials: SharedCredentials::new(Credentials::new(client_code, feed_token)),
            policy: ReconnectPolicy::default(),
            registry: SubscriptionRegistry::new(tokens.into()),
            listener: Arc::new(NoopListener),
            active: ActiveSession::default(),
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets an explicit stream endpoint override.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim_end().to_string();
        self
    }

    /// Skips server certificate verification.
    ///
    /// Only for feeds served behind certificates that do not match their
    /// host name. Off by default.
    pub fn with_danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.policy = self.policy.with_auto_reconnect(auto_reconnect);
        self
    }

    pub fn with_reconnect_max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy = self.policy.with_max_attempts(max_attempts);
        self
    }

    /// Sets the backoff ceiling; fails below five seconds.
    pub fn with_reconnect_max_delay(mut self, max_delay: Duration) -> Result<Self, TickerError> {
        self.policy = self.policy.with_max_delay(max_delay)?;
        Ok(self)
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.policy = self.policy.with_connect_timeout(connect_timeout);
        self
    }

    /// Replaces the whole reconnect policy.
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Routes lifecycle events to `listener`, replacing any previous one.
    pub fn with_listener(mut self, listener: impl TickerListener + 'static) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    /// Registers closure callbacks; slots left empty are no-ops.
    pub fn with_callbacks(self, callbacks: Callbacks) -> Self {
        self.with_listener(callbacks)
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns a cloneable handle bound to this client's stream.
    pub fn sender(&self) -> TickerSender {
        TickerSender {
            registry: self.registry.clone(),
            credentials: self.credentials.clone(),
            active: self.active.clone(),
            listener: Arc::clone(&self.listener),
            state: self.state.subscribe(),
            cancel: self.cancel.clone(),
        }
    }

    /// Runs the stream until it is closed, gives up, or hits a failure that
    /// cannot be retried.
    ///
    /// Returns `Ok(())` after [`TickerSender::close`].
    pub async fn serve(self) -> Result<(), TickerError> {
        let dialer = WsDialer::new(self.endpoint.clone(), self.accept_invalid_certs)?;
        info!(
            event = "ticker_start",
            endpoint = %self.endpoint,
            entries = self.registry.current().entries().count(),
            auto_reconnect = self.policy.auto_reconnect
        );
        Scheduler {
            dialer: Arc::new(dialer),
            credentials: self.credentials,
            policy: self.policy,
            registry: self.registry,
            listener: self.listener,
            active: self.active,
            state: self.state,
            cancel: self.cancel,
        }
        .run()
        .await
    }

    /// Spawns [`TickerClient::serve`] on the current tokio runtime.
    pub fn spawn(self) -> TickerHandle {
        let sender = self.sender();
        let task = tokio::spawn(self.serve());
        TickerHandle { sender, task }
    }
}

/// Cloneable handle for a running (or not yet started) stream.
#[derive(Clone)]
pub struct TickerSender {
    registry: SubscriptionRegistry,
    credentials: SharedCredentials,
    active: ActiveSession,
    listener: Arc<dyn TickerListener>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl TickerSender {
    /// Subscribes the current token list on the live session.
    ///
    /// A failed write is also reported to the listener's error callback.
    pub async fn subscribe(&self) -> Result<(), TickerError> {
        let writer = self.active.current().ok_or(TickerError::NotConnected)?;
        let result = self
            .registry
            .subscribe(&writer, &self.credentials.snapshot())
            .await;
        if let Err(err) = &result {
            warn!(event = "subscribe_failed", error = %err);
            self.listener.on_error(err);
        }
        result
    }

    /// Replaces the subscription set. Takes effect on the next subscribe or
    /// reconnect.
    pub fn set_tokens(&self, tokens: impl Into<TokenList>) {
        self.registry.replace(tokens.into());
    }

    pub fn tokens(&self) -> TokenList {
        self.registry.current()
    }

    /// Rotates the feed token used by every following control frame.
    pub fn set_feed_token(&self, feed_token: SecretString) {
        self.credentials.set_feed_token(feed_token);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }

    /// Waits until the stream reaches `state`.
    ///
    /// Returns `false` when the stream was dropped first.
    pub async fn wait_for(&self, state: ConnectionState) -> bool {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|current| *current == state).await.is_ok();
        reached
    }

    /// Stops the stream: interrupts dial, backoff or streaming and sends a
    /// normal close frame on the live session.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Handle to a stream spawned with [`TickerClient::spawn`].
pub struct TickerHandle {
    sender: TickerSender,
    task: JoinHandle<Result<(), TickerError>>,
}

impl TickerHandle {
    pub fn sender(&self) -> TickerSender {
        self.sender.clone()
    }

    /// Waits for the stream to stop.
    pub async fn join(self) -> Result<(), TickerError> {
        self.task.await?
    }

    /// Closes the stream and waits for it to stop.
    pub async fn close(self) -> Result<(), TickerError> {
        self.sender.close();
        self.join().await
    }
}
