//! Follow the live progress of one buying group.
//!
//! This demo:
//! 1. Registers a handler for `progress_update` and a wildcard logger
//! 2. Logs every connection state change
//! 3. Subscribes to a group before connecting, then streams frames
//! 4. Switches to a second group halfway through
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info,groupbuy_live=debug cargo run --example group_progress -- wss://live.example.com/ws/groups 42 43
//! ```
//!
//! Set `GROUPBUY_TOKEN` to connect with an auth token.

use std::time::Duration;

use futures::StreamExt as _;
use groupbuy_live::auth::StaticToken;
use groupbuy_live::ws::config::Config;
use groupbuy_live::ws::{Handler, WILDCARD};
use groupbuy_live::{Client, GroupId};
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct Progress {
    current_quantity: u64,
    #[serde(default)]
    target_quantity: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let endpoint = args
        .next()
        .unwrap_or_else(|| "ws://127.0.0.1:8080/ws/groups".to_owned());
    let first: GroupId = args.next().map_or(Ok(1), |s| s.parse())?;
    let second: GroupId = args.next().map_or(Ok(first + 1), |s| s.parse())?;

    let client = match std::env::var("GROUPBUY_TOKEN") {
        Ok(token) => {
            Client::with_token_provider(&endpoint, Config::default(), StaticToken::new(token))?
        }
        Err(_) => Client::new(&endpoint, Config::default())?,
    };

    let state_listener = client.on_state_change(|state| info!(%state, "connection state"));

    client.on(
        "progress_update",
        Handler::new(|data| match Progress::deserialize(data) {
            Ok(progress) => info!(
                current = progress.current_quantity,
                target = ?progress.target_quantity,
                "group progress"
            ),
            Err(e) => warn!(error = %e, "unexpected progress payload"),
        }),
    );
    client.on(
        WILDCARD,
        Handler::new(|envelope| debug!(%envelope, "frame")),
    );

    client.subscribe_to_topic(first);
    client.connect();

    let mut frames = Box::pin(client.frames());
    let mut count = 0;
    while let Ok(Some(result)) = timeout(Duration::from_secs(30), frames.next()).await {
        match result {
            Ok(frame) => {
                count += 1;
                info!(frame_type = %frame.frame_type, count, "received");
                if count == 5 {
                    info!(from = first, to = second, "switching group");
                    client.subscribe_to_topic(second);
                }
                if count >= 10 {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "frame stream error"),
        }
    }

    client.unsubscribe_from_topic();
    client.disconnect();
    _ = state_listener.unsubscribe();
    info!(received = count, state = %client.state(), "done");

    Ok(())
}
