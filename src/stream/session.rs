//! One physical connection to the feed server.
//!
//! A [`Session`] exists only after the transport handshake and the `cn`
//! authentication exchange both succeeded. Its write half is a
//! [`SessionWriter`], which serializes heartbeat, subscribe and close frames
//! behind a single lock.

use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use secrecy::SecretString;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, WebSocketStream};
use tracing::{debug, warn};

use crate::retry::with_timeout;
use crate::stream::error::TickerError;
use crate::stream::proto::{
    ack_marker, decode_frame, is_rejected, ControlFrame, Credentials, DecodeError, TickRecord,
};

pub(crate) type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub(crate) type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Raw, not yet authenticated websocket halves.
pub(crate) struct Transport {
    pub(crate) sink: FrameSink,
    pub(crate) stream: FrameStream,
}

impl Transport {
    pub(crate) fn from_socket<S>(socket: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens transports to the feed server.
pub(crate) trait Dial: Send + Sync {
    fn dial(&self) -> BoxFuture<'_, Result<Transport, TickerError>>;
}

/// Dials the websocket endpoint over rustls.
pub(crate) struct WsDialer {
    endpoint: String,
    tls: Arc<rustls::ClientConfig>,
}

impl WsDialer {
    pub(crate) fn new(endpoint: String, accept_invalid_certs: bool) -> Result<Self, TickerError> {
        let tls = if accept_invalid_certs {
            warn!(event = "tls_verification_disabled", endpoint = %endpoint);
            tls::insecure_config()?
        } else {
            tls::verified_config()?
        };
        Ok(Self {
            endpoint,
            tls: Arc::new(tls),
        })
    }
}

impl Dial for WsDialer {
    fn dial(&self) -> BoxFuture<'_, Result<Transport, TickerError>> {
        Box::pin(async move {
            let request = self
                .endpoint
                .as_str()
                .into_client_request()
                .map_err(TickerError::Connect)?;
            let connector = Connector::Rustls(Arc::clone(&self.tls));
            let (socket, _) = connect_async_tls_with_config(request, None, true, Some(connector))
                .await
                .map_err(TickerError::Connect)?;
            Ok(Transport::from_socket(socket))
        })
    }
}

/// Serialized write half of a live session.
#[derive(Clone)]
pub(crate) struct SessionWriter {
    sink: Arc<Mutex<FrameSink>>,
}

impl SessionWriter {
    pub(crate) fn new(sink: FrameSink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub(crate) async fn send(&self, message: Message) -> Result<(), TickerError> {
        let mut sink = self.sink.lock().await;
        sink.send(message).await.map_err(TickerError::Transport)
    }

    pub(crate) async fn send_frame(&self, frame: &ControlFrame) -> Result<(), TickerError> {
        let text = frame.to_text()?;
        self.send(Message::Text(text)).await
    }

    /// Sends a normal-closure close frame.
    pub(crate) async fn send_close(&self) -> Result<(), TickerError> {
        self.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })))
        .await
    }

    /// Closes the underlying transport. Errors are ignored, the socket may
    /// already be gone.
    pub(crate) async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}

/// Slot holding the writer of the live session, if any.
#[derive(Clone, Default)]
pub(crate) struct ActiveSession {
    writer: Arc<RwLock<Option<SessionWriter>>>,
}

impl ActiveSession {
    pub(crate) fn install(&self, writer: SessionWriter) {
        match self.writer.write() {
            Ok(mut guard) => *guard = Some(writer),
            Err(poisoned) => *poisoned.into_inner() = Some(writer),
        }
    }

    pub(crate) fn clear(&self) {
        match self.writer.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
    }

    pub(crate) fn current(&self) -> Option<SessionWriter> {
        match self.writer.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Credentials shared between the caller handle and the scheduler.
#[derive(Clone, Debug)]
pub(crate) struct SharedCredentials {
    inner: Arc<RwLock<Credentials>>,
}

impl SharedCredentials {
    pub(crate) fn new(credentials: Credentials) -> Self {
        Self {
            inner: Arc::new(RwLock::new(credentials)),
        }
    }

    pub(crate) fn snapshot(&self) -> Credentials {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_feed_token(&self, feed_token: SecretString) {
        match self.inner.write() {
            Ok(mut guard) => guard.feed_token = feed_token,
            Err(poisoned) => poisoned.into_inner().feed_token = feed_token,
        }
    }
}

/// Authenticated connection: serialized writer plus the read half.
pub(crate) struct Session {
    pub(crate) writer: SessionWriter,
    pub(crate) stream: FrameStream,
}

impl Session {
    /// Sends the `cn` frame and validates the server's first reply.
    ///
    /// The reply read is bounded by `reply_timeout`. The transport is closed
    /// on any failure.
    pub(crate) async fn authenticate(
        transport: Transport,
        credentials: &Credentials,
        reply_timeout: Duration,
    ) -> Result<Self, TickerError> {
        let writer = SessionWriter::new(transport.sink);
        let mut stream = transport.stream;

        let result = async {
            writer
                .send_frame(&ControlFrame::connect(credentials))
                .await?;
            let records = with_timeout(reply_timeout, read_reply(&mut stream, &writer))
                .await
                .map_err(|_| TickerError::ConnectTimeout(reply_timeout))??;
            validate_handshake(&records)
        }
        .await;

        match result {
            Ok(()) => {
                debug!(event = "session_authenticated", user = %credentials.client_code);
                Ok(Self { writer, stream })
            }
            Err(err) => {
                writer.close().await;
                Err(err)
            }
        }
    }
}

/// Checks the decoded authentication reply.
pub(crate) fn validate_handshake(records: &[TickRecord]) -> Result<(), TickerError> {
    if ack_marker(records).is_none() {
        return Err(TickerError::Protocol("invalid message".to_string()));
    }
    if is_rejected(records) {
        return Err(TickerError::Auth(
            "invalid feed token or client code".to_string(),
        ));
    }
    Ok(())
}

async fn read_reply(
    stream: &mut FrameStream,
    writer: &SessionWriter,
) -> Result<Vec<TickRecord>, TickerError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(decode_frame(&text)?),
            Some(Ok(Message::Binary(bytes))) => {
                let text = String::from_utf8(bytes).map_err(DecodeError::from)?;
                return Ok(decode_frame(&text)?);
            }
            Some(Ok(Message::Ping(payload))) => writer.send(Message::Pong(payload)).await?,
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Close(_))) | None => return Err(TickerError::ConnectionClosed),
            Some(Err(err)) => return Err(TickerError::Transport(err)),
        }
    }
}

mod tls {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

    use crate::stream::error::TickerError;

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub(super) fn verified_config() -> Result<ClientConfig, TickerError> {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Ok(ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|err| TickerError::Config(format!("tls: {err}")))?
            .with_root_certificates(roots)
            .with_no_client_auth())
    }

    pub(super) fn insecure_config() -> Result<ClientConfig, TickerError> {
        let provider = provider();
        Ok(ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|err| TickerError::Config(format!("tls: {err}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
            .with_no_client_auth())
    }

    #[derive(Debug)]
    struct AcceptAnyCert {
        provider: Arc<CryptoProvider>,
    }

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;
    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message;

    use super::testing::memory_transport;
    use super::{validate_handshake, ActiveSession, Session, SessionWriter, SharedCredentials};
    use crate::stream::error::TickerError;
    use crate::stream::proto::{ControlFrame, Credentials, Task, TickRecord};

    const REPLY_TIMEOUT: Duration = Duration::from_secs(7);

    fn credentials() -> Credentials {
        Credentials::new("C42", SecretString::new("feed".to_string()))
    }

    fn records(value: serde_json::Value) -> Vec<TickRecord> {
        serde_json::from_value(value).expect("records")
    }

    #[test]
    fn empty_reply_is_a_protocol_error() {
        let err = validate_handshake(&[]).expect_err("empty reply");
        assert!(matches!(err, TickerError::Protocol(message) if message == "invalid message"));
    }

    #[test]
    fn reply_without_ack_is_a_protocol_error() {
        let err = validate_handshake(&records(json!([{"tk": "3045"}]))).expect_err("no ack");
        assert!(matches!(err, TickerError::Protocol(_)));
    }

    #[test]
    fn rejected_ack_is_an_auth_error() {
        let err = validate_handshake(&records(json!([{"ak": "nk"}]))).expect_err("rejected");
        assert!(
            matches!(err, TickerError::Auth(message) if message == "invalid feed token or client code")
        );
    }

    #[test]
    fn any_other_ack_is_accepted() {
        assert!(validate_handshake(&records(json!([{"ak": "ok"}]))).is_ok());
    }

    #[tokio::test]
    async fn authenticate_sends_connect_frame_first() {
        let (transport, mut peer) = memory_transport();
        peer.push_ack("ok");

        let session = Session::authenticate(transport, &credentials(), REPLY_TIMEOUT).await;
        assert!(session.is_ok());

        let texts = peer.written_texts();
        assert_eq!(texts.len(), 1);
        let frame = ControlFrame::from_text(&texts[0]).expect("control frame");
        assert_eq!(frame.task, Task::Connect);
        assert_eq!(frame.user, "C42");
        assert_eq!(frame.acctid, "C42");
        assert_eq!(frame.token, "feed");
    }

    #[tokio::test]
    async fn authenticate_answers_pings_before_reply() {
        let (transport, mut peer) = memory_transport();
        peer.inbound
            .send(Ok(Message::Ping(vec![7])))
            .expect("peer open");
        peer.push_ack("ok");

        assert!(Session::authenticate(transport, &credentials(), REPLY_TIMEOUT)
            .await
            .is_ok());

        let _connect = peer.outbound.recv().await.expect("connect frame");
        assert_eq!(peer.outbound.recv().await, Some(Message::Pong(vec![7])));
    }

    #[tokio::test]
    async fn authenticate_rejects_bad_credentials() {
        let (transport, peer) = memory_transport();
        peer.push_ack("nk");

        let err = Session::authenticate(transport, &credentials(), REPLY_TIMEOUT)
            .await
            .err()
            .expect("rejected");
        assert!(matches!(err, TickerError::Auth(_)));
    }

    #[tokio::test]
    async fn authenticate_fails_when_peer_hangs_up() {
        let (transport, peer) = memory_transport();
        drop(peer.inbound);

        let err = Session::authenticate(transport, &credentials(), REPLY_TIMEOUT)
            .await
            .err()
            .expect("closed");
        assert!(matches!(err, TickerError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn authenticate_times_out_without_reply() {
        let (transport, _peer) = memory_transport();

        let err = Session::authenticate(transport, &credentials(), REPLY_TIMEOUT)
            .await
            .err()
            .expect("timeout");
        assert!(matches!(err, TickerError::ConnectTimeout(timeout) if timeout == REPLY_TIMEOUT));
    }

    #[tokio::test]
    async fn writer_fails_once_peer_is_gone() {
        let (transport, peer) = memory_transport();
        let writer = SessionWriter::new(transport.sink);
        drop(peer);

        let err = writer
            .send_frame(&ControlFrame::heartbeat(&credentials()))
            .await
            .expect_err("peer dropped");
        assert!(matches!(err, TickerError::Transport(_)));
    }

    #[tokio::test]
    async fn active_session_tracks_single_writer() {
        let (transport, _peer) = memory_transport();
        let active = ActiveSession::default();
        assert!(active.current().is_none());

        active.install(SessionWriter::new(transport.sink));
        assert!(active.current().is_some());

        active.clear();
        assert!(active.current().is_none());
    }

    #[tokio::test]
    async fn active_session_recovers_from_poisoned_lock() {
        let (transport, _peer) = memory_transport();
        let active = ActiveSession::default();
        let poisoner = active.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.writer.write().expect("lock");
            panic!("poison the writer lock");
        })
        .join();

        active.install(SessionWriter::new(transport.sink));
        assert!(active.current().is_some());
        active.clear();
        assert!(active.current().is_none());
    }

    #[test]
    fn feed_token_update_is_visible_to_clones() {
        let shared = SharedCredentials::new(credentials());
        let clone = shared.clone();
        clone.set_feed_token(SecretString::new("rotated".to_string()));

        let frame = ControlFrame::heartbeat(&shared.snapshot());
        assert_eq!(frame.token, "rotated");
    }
}
