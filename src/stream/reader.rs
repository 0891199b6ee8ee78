//! Read loop for one session generation.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stream::dispatch::TickerListener;
use crate::stream::error::TickerError;
use crate::stream::proto::{decode_frame, is_rejected, DecodeError};
use crate::stream::scheduler::TaskExit;
use crate::stream::session::{FrameStream, SessionWriter};

/// Reads frames until the transport ends, a frame fails to decode, or the
/// server rejects the credentials.
///
/// Only the `nk` marker is treated as control traffic. Any other non-empty
/// frame, including acknowledgements such as `[{"ak":"ok"}]`, reaches
/// `on_message` unchanged; listeners that care can check [`ack_marker`].
///
/// [`ack_marker`]: crate::stream::proto::ack_marker
pub(crate) async fn run_reader(
    mut stream: FrameStream,
    writer: SessionWriter,
    listener: Arc<dyn TickerListener>,
    generation: CancellationToken,
) -> TaskExit {
    let _end_generation = generation.clone().drop_guard();

    loop {
        let next = tokio::select! {
            _ = generation.cancelled() => return TaskExit::Stopped,
            next = stream.next() => next,
        };

        let step = match next {
            Some(Ok(Message::Text(text))) => dispatch_frame(&text, listener.as_ref()),
            Some(Ok(Message::Binary(bytes))) => String::from_utf8(bytes)
                .map_err(|err| TickerError::Decode(DecodeError::from(err)))
                .and_then(|text| dispatch_frame(&text, listener.as_ref())),
            Some(Ok(Message::Ping(payload))) => writer.send(Message::Pong(payload)).await,
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => Ok(()),
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|frame| (u16::from(frame.code), frame.reason.into_owned()))
                    .unwrap_or((1005, String::new()));
                debug!(event = "peer_closed", code, reason = %reason);
                listener.on_close(code, &reason);
                Err(TickerError::ConnectionClosed)
            }
            Some(Err(err)) => Err(TickerError::Transport(err)),
            None => Err(TickerError::ConnectionClosed),
        };

        if let Err(err) = step {
            warn!(event = "read_loop_ended", error = %err);
            listener.on_error(&err);
            return TaskExit::Failed(err);
        }
    }
}

fn dispatch_frame(text: &str, listener: &dyn TickerListener) -> Result<(), TickerError> {
    let records = decode_frame(text)?;
    if records.is_empty() {
        return Ok(());
    }
    if is_rejected(&records) {
        return Err(TickerError::Auth(
            "invalid feed token or client code".to_string(),
        ));
    }
    listener.on_message(&records);
    Ok(())
}
