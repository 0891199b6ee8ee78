//! Instrument token list and subscribe/resubscribe frames.

use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::stream::error::TickerError;
use crate::stream::proto::{ControlFrame, Credentials};
use crate::stream::session::SessionWriter;

const ENTRY_SEPARATOR: char = '&';
const FIELD_SEPARATOR: char = '|';

/// Ampersand-joined list of `<exchange-segment>|<symbol-token>` entries.
///
/// The list is sent verbatim as the `channel` of a subscribe frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenList(String);

impl TokenList {
    /// Builds a list from `(segment, token)` pairs, e.g. `("nse_cm", "3045")`.
    pub fn from_pairs<I, S, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let joined = pairs
            .into_iter()
            .map(|(segment, token)| {
                format!("{}{FIELD_SEPARATOR}{}", segment.as_ref(), token.as_ref())
            })
            .collect::<Vec<_>>()
            .join(&ENTRY_SEPARATOR.to_string());
        Self(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the raw entries of the list.
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.0.split(ENTRY_SEPARATOR).filter(|entry| !entry.is_empty())
    }
}

impl From<String> for TokenList {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TokenList {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TokenList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current subscription set, shared between the caller and the scheduler.
///
/// The set is only ever replaced wholesale by the caller; reconnects reuse it
/// as-is.
#[derive(Clone, Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    tokens: Arc<RwLock<TokenList>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(tokens: TokenList) -> Self {
        Self {
            tokens: Arc::new(RwLock::new(tokens)),
        }
    }

    pub(crate) fn replace(&self, tokens: TokenList) {
        match self.tokens.write() {
            Ok(mut guard) => *guard = tokens,
            Err(poisoned) => *poisoned.into_inner() = tokens,
        }
    }

    pub(crate) fn current(&self) -> TokenList {
        match self.tokens.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Writes a subscribe frame for the current token list.
    pub(crate) async fn subscribe(
        &self,
        writer: &SessionWriter,
        credentials: &Credentials,
    ) -> Result<(), TickerError> {
        let tokens = self.current();
        debug!(event = "subscribe", entries = tokens.entries().count());
        writer
            .send_frame(&ControlFrame::market_watch(tokens.as_str(), credentials))
            .await
    }

    /// Restores the subscription on a freshly reconnected session.
    pub(crate) async fn resubscribe(
        &self,
        writer: &SessionWriter,
        credentials: &Credentials,
    ) -> Result<(), TickerError> {
        self.subscribe(writer, credentials).await
    }
}
