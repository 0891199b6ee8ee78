//! Periodic `hb` frames on a live session.
//!
//! A failed heartbeat write is the only liveness signal: the task reports
//! the error, closes the transport and ends the generation.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stream::dispatch::TickerListener;
use crate::stream::proto::ControlFrame;
use crate::stream::scheduler::TaskExit;
use crate::stream::session::{SessionWriter, SharedCredentials};

pub(crate) async fn run_heartbeat(
    writer: SessionWriter,
    credentials: SharedCredentials,
    interval: Duration,
    listener: Arc<dyn TickerListener>,
    generation: CancellationToken,
) -> TaskExit {
    let _end_generation = generation.clone().drop_guard();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = generation.cancelled() => return TaskExit::Stopped,
            _ = ticker.tick() => {
                let frame = ControlFrame::heartbeat(&credentials.snapshot());
                if let Err(err) = writer.send_frame(&frame).await {
                    warn!(event = "heartbeat_failed", error = %err);
                    listener.on_error(&err);
                    writer.close().await;
                    return TaskExit::Failed(err);
                }
                debug!(event = "heartbeat_sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use secrecy::SecretString;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_util::sync::CancellationToken;

    use super::run_heartbeat;
    use crate::stream::dispatch::{ChannelListener, TickerEvent};
    use crate::stream::error::TickerError;
    use crate::stream::proto::{ControlFrame, Credentials, Task};
    use crate::stream::scheduler::TaskExit;
    use crate::stream::session::testing::memory_transport;
    use crate::stream::session::{SessionWriter, SharedCredentials};

    const INTERVAL: Duration = Duration::from_secs(60);

    fn credentials() -> SharedCredentials {
        SharedCredentials::new(Credentials::new("C7", SecretString::new("feed".to_string())))
    }

    #[tokio::test(start_paused = true)]
    async fn writes_heartbeat_every_interval() {
        let (transport, mut peer) = memory_transport();
        let (listener, _events) = ChannelListener::new();
        let generation = CancellationToken::new();
        let task = tokio::spawn(run_heartbeat(
            SessionWriter::new(transport.sink),
            credentials(),
            INTERVAL,
            Arc::new(listener),
            generation.clone(),
        ));

        for _ in 0..2 {
            let Some(Message::Text(text)) = peer.outbound.recv().await else {
                panic!("expected heartbeat frame");
            };
            let frame = ControlFrame::from_text(&text).expect("control frame");
            assert_eq!(frame.task, Task::Heartbeat);
            assert_eq!(frame.user, "C7");
        }

        generation.cancel();
        assert!(matches!(task.await.expect("join"), TaskExit::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_reports_error_and_ends_generation() {
        let (transport, peer) = memory_transport();
        let (listener, mut events) = ChannelListener::new();
        let generation = CancellationToken::new();
        drop(peer.outbound);

        let exit = run_heartbeat(
            SessionWriter::new(transport.sink),
            credentials(),
            INTERVAL,
            Arc::new(listener),
            generation.clone(),
        )
        .await;

        assert!(matches!(exit, TaskExit::Failed(TickerError::Transport(_))));
        assert!(matches!(events.try_recv(), Ok(TickerEvent::Error(_))));
        assert!(generation.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_without_writing_when_generation_ends_first() {
        let (transport, mut peer) = memory_transport();
        let (listener, _events) = ChannelListener::new();
        let generation = CancellationToken::new();
        generation.cancel();

        let exit = run_heartbeat(
            SessionWriter::new(transport.sink),
            credentials(),
            INTERVAL,
            Arc::new(listener),
            generation,
        )
        .await;

        assert!(matches!(exit, TaskExit::Stopped));
        assert!(peer.written_texts().is_empty());
    }
}
