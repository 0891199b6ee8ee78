use std::error::Error;
use std::time::Duration;

use secrecy::SecretString;
use smartapi_ticker::{Callbacks, ConnectionState, TickerClient, TokenList};
use tracing_subscriber::EnvFilter;

fn required_env(name: &str) -> Result<String, Box<dyn Error>> {
    std::env::var(name).map_err(|_| format!("missing environment variable {name}").into())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let client_code = required_env("SMARTAPI_CLIENT_CODE")?;
    let feed_token = SecretString::new(required_env("SMARTAPI_FEED_TOKEN")?);
    let tokens = TokenList::from_pairs([("nse_cm", "2885"), ("nse_cm", "1594")]);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let callbacks = Callbacks::default()
            .with_message(|ticks| {
                for tick in ticks {
                    println!("tick {}", serde_json::Value::Object(tick.clone()));
                }
            })
            .with_error(|err| eprintln!("stream error: {err}"))
            .with_close(|code, reason| eprintln!("closed code={code} reason={reason}"))
            .with_reconnect(|attempt, delay| {
                eprintln!("reconnect attempt={attempt} in {}s", delay.as_secs())
            })
            .with_no_reconnect(|attempt| eprintln!("giving up after attempt={attempt}"));

        let handle = TickerClient::new(client_code, feed_token, tokens)
            .with_reconnect_max_delay(Duration::from_secs(30))?
            .with_callbacks(callbacks)
            .spawn();

        let sender = handle.sender();
        if sender.wait_for(ConnectionState::Streaming).await {
            sender.subscribe().await?;
        }

        tokio::select! {
            result = handle.join() => result?,
            _ = tokio::signal::ctrl_c() => {
                sender.close();
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
