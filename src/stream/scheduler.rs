//! Connection lifecycle: dial, authenticate, stream, back off, retry.
//!
//! One scheduler drives at most one session at a time. Each generation runs
//! the read loop and (with auto-reconnect on) the heartbeat as two tasks and
//! joins both before the next dial. Tasks report how they ended through
//! [`TaskExit`]; only the scheduler touches the attempt counter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::{with_timeout, ReconnectPolicy};
use crate::stream::dispatch::TickerListener;
use crate::stream::error::TickerError;
use crate::stream::heartbeat::run_heartbeat;
use crate::stream::reader::run_reader;
use crate::stream::session::{ActiveSession, Dial, Session, SessionWriter, SharedCredentials};
use crate::stream::subscription::SubscriptionRegistry;

/// Lifecycle state published to [`crate::stream::client::TickerSender::state`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Streaming,
    /// Waiting before the next reconnect attempt.
    Backoff,
    /// Terminal.
    Closed,
}

/// How a session task ended.
#[derive(Debug)]
pub(crate) enum TaskExit {
    /// The generation was ended by the other task or by cancellation.
    Stopped,
    Failed(TickerError),
}

impl TaskExit {
    fn into_failure(self) -> Option<TickerError> {
        match self {
            TaskExit::Stopped => None,
            TaskExit::Failed(err) => Some(err),
        }
    }
}

pub(crate) struct Scheduler {
    pub(crate) dialer: Arc<dyn Dial>,
    pub(crate) credentials: SharedCredentials,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) listener: Arc<dyn TickerListener>,
    pub(crate) active: ActiveSession,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) cancel: CancellationToken,
}

impl Scheduler {
    /// Runs until cancelled, until attempts are exhausted, or until a failure
    /// that must not be retried.
    pub(crate) async fn run(self) -> Result<(), TickerError> {
        let mut attempt: u32 = 0;
        let mut previous: Option<SessionWriter> = None;

        let result = loop {
            if self.policy.is_exhausted(attempt) {
                warn!(
                    event = "reconnect_exhausted",
                    attempt,
                    max_attempts = self.policy.max_attempts
                );
                self.listener.on_no_reconnect(attempt);
                break Err(TickerError::RetryExhausted { attempts: attempt });
            }

            if attempt > 0 {
                let delay = self.policy.delay_for_attempt(attempt);
                self.set_state(ConnectionState::Backoff);
                info!(
                    event = "reconnect_scheduled",
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );
                self.listener.on_reconnect(attempt, delay);
                if !self.backoff(delay).await {
                    break Ok(());
                }
                if let Some(writer) = previous.take() {
                    writer.close().await;
                }
            }

            let session = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                result = self.connect() => result,
            };
            let session = match session {
                Ok(session) => session,
                Err(err) => {
                    warn!(event = "connect_failed", attempt, error = %err);
                    self.listener.on_error(&err);
                    if self.policy.auto_reconnect && err.is_retryable() {
                        attempt += 1;
                        continue;
                    }
                    break Err(err);
                }
            };

            if attempt > 0 {
                let credentials = self.credentials.snapshot();
                if let Err(err) = self.registry.resubscribe(&session.writer, &credentials).await {
                    warn!(event = "resubscribe_failed", attempt, error = %err);
                    self.listener.on_error(&err);
                    session.writer.close().await;
                    if self.policy.auto_reconnect {
                        attempt += 1;
                        continue;
                    }
                    break Err(err);
                }
                info!(event = "resubscribed", attempt);
            }
            attempt = 0;

            let writer = session.writer.clone();
            let failure = self.stream(session).await;
            self.active.clear();

            if self.cancel.is_cancelled() {
                debug!(event = "session_shutdown");
                if let Err(err) = writer.send_close().await {
                    debug!(event = "close_frame_failed", error = %err);
                }
                writer.close().await;
                break Ok(());
            }
            previous = Some(writer);

            let err = failure.unwrap_or(TickerError::ConnectionClosed);
            if !err.is_retryable() || !self.policy.auto_reconnect {
                warn!(event = "session_terminated", error = %err);
                break Err(err);
            }
            attempt += 1;
        };

        if let Some(writer) = previous.take() {
            writer.close().await;
        }
        self.active.clear();
        self.set_state(ConnectionState::Closed);
        result
    }

    async fn connect(&self) -> Result<Session, TickerError> {
        let timeout = self.policy.connect_timeout;
        self.set_state(ConnectionState::Connecting);
        let transport = with_timeout(timeout, self.dialer.dial())
            .await
            .map_err(|_| TickerError::ConnectTimeout(timeout))??;

        self.set_state(ConnectionState::Authenticating);
        Session::authenticate(transport, &self.credentials.snapshot(), timeout).await
    }

    /// Runs one generation and returns the failure that ended it, if any.
    async fn stream(&self, session: Session) -> Option<TickerError> {
        let Session { writer, stream } = session;
        let generation = self.cancel.child_token();

        self.active.install(writer.clone());
        self.set_state(ConnectionState::Streaming);
        info!(event = "connected");
        self.listener.on_connect();

        let reader = tokio::spawn(run_reader(
            stream,
            writer.clone(),
            Arc::clone(&self.listener),
            generation.clone(),
        ));
        let heartbeat = self.policy.auto_reconnect.then(|| {
            tokio::spawn(run_heartbeat(
                writer,
                self.credentials.clone(),
                self.policy.heartbeat_interval(),
                Arc::clone(&self.listener),
                generation.clone(),
            ))
        });

        let read_exit = self.joined(reader.await);
        let heartbeat_exit = match heartbeat {
            Some(task) => self.joined(task.await),
            None => TaskExit::Stopped,
        };

        match (read_exit.into_failure(), heartbeat_exit.into_failure()) {
            (Some(read), Some(beat)) => Some(if beat.is_retryable() { read } else { beat }),
            (read, beat) => read.or(beat),
        }
    }

    fn joined(&self, joined: Result<TaskExit, JoinError>) -> TaskExit {
        joined.unwrap_or_else(|err| {
            let err = TickerError::Task(err);
            self.listener.on_error(&err);
            TaskExit::Failed(err)
        })
    }

    /// Sleeps for `delay`; returns `false` when cancelled first.
    async fn backoff(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(event = "state_changed", state = ?state);
        self.state.send_replace(state);
    }
}
