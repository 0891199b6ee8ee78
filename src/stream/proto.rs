//! Wire protocol shared with the feed server.
//!
//! Outbound traffic is plain JSON control frames. Inbound frames are base64
//! text wrapping a zlib-compressed JSON array of tick records.

use std::fmt;
use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Field the server uses for acknowledgement and rejection signalling.
pub const ACK_FIELD: &str = "ak";
/// Acknowledgement value meaning "invalid feed token or client code".
pub const ACK_REJECTED: &str = "nk";

/// One decoded tick record. Fields are opaque to the client.
pub type TickRecord = serde_json::Map<String, serde_json::Value>;

/// Client identifier and feed token issued by the session API.
#[derive(Clone)]
pub struct Credentials {
    pub client_code: String,
    pub feed_token: SecretString,
}

impl Credentials {
    pub fn new(client_code: impl Into<String>, feed_token: SecretString) -> Self {
        Self {
            client_code: client_code.into(),
            feed_token,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_code", &self.client_code)
            .field("feed_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Task {
    /// Authenticate a freshly dialed connection.
    #[serde(rename = "cn")]
    Connect,
    #[serde(rename = "hb")]
    Heartbeat,
    /// Subscribe the token list ("market watch").
    #[serde(rename = "mw")]
    MarketWatch,
}

/// Outbound control frame.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlFrame {
    pub task: Task,
    pub channel: String,
    pub token: String,
    pub user: String,
    pub acctid: String,
}

impl ControlFrame {
    pub fn new(task: Task, channel: impl Into<String>, credentials: &Credentials) -> Self {
        Self {
            task,
            channel: channel.into(),
            token: credentials.feed_token.expose_secret().clone(),
            user: credentials.client_code.clone(),
            acctid: credentials.client_code.clone(),
        }
    }

    pub fn connect(credentials: &Credentials) -> Self {
        Self::new(Task::Connect, "", credentials)
    }

    pub fn heartbeat(credentials: &Credentials) -> Self {
        Self::new(Task::Heartbeat, "", credentials)
    }

    pub fn market_watch(tokens: &str, credentials: &Credentials) -> Self {
        Self::new(Task::MarketWatch, tokens, credentials)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl fmt::Debug for ControlFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlFrame")
            .field("task", &self.task)
            .field("channel", &self.channel)
            .field("token", &"[REDACTED]")
            .field("user", &self.user)
            .field("acctid", &self.acctid)
            .finish()
    }
}

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("inflate failed: {0}")]
    Inflate(#[source] std::io::Error),

    #[error("invalid tick payload: {0}")]
    Json(#[source] serde_json::Error),

    #[error("binary frame is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Decodes one inbound frame into its tick records.
///
/// Malformed base64 is tolerated: the error is logged and decoding continues
/// on an empty buffer, which then fails at the inflate or parse stage. An
/// empty array is a valid "no data" frame.
pub fn decode_frame(raw: &str) -> Result<Vec<TickRecord>, DecodeError> {
    let compressed = match BASE64_STANDARD.decode(raw.trim()) {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(event = "frame_base64_invalid", error = %err);
            Vec::new()
        }
    };

    let mut inflated = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut inflated)
        .map_err(DecodeError::Inflate)?;

    serde_json::from_slice(&inflated).map_err(DecodeError::Json)
}

/// Encodes tick records the way the feed server frames them.
pub fn encode_frame(records: &[TickRecord]) -> Result<String, std::io::Error> {
    let json = serde_json::to_vec(records)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(BASE64_STANDARD.encode(compressed))
}

/// Returns the acknowledgement value of the first record, if present.
pub fn ack_marker(records: &[TickRecord]) -> Option<&serde_json::Value> {
    records.first().and_then(|record| record.get(ACK_FIELD))
}

/// Returns `true` when the frame carries the credential rejection marker.
pub fn is_rejected(records: &[TickRecord]) -> bool {
    ack_marker(records).and_then(serde_json::Value::as_str) == Some(ACK_REJECTED)
}
