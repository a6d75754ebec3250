use std::sync::Arc;

use async_stream::try_stream;
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;

use crate::Result;
use crate::auth::{Anonymous, TokenProvider};
use crate::ws::config::Config;
use crate::ws::dispatcher::StateListener;
use crate::ws::{ConnectionManager, ConnectionState, Frame, GroupId, Handler, WsError};

/// Live client for buying-group updates.
///
/// One `Client` owns one session. Clone it and hand the clones to every part
/// of the application that needs live data, so the topic subscription,
/// keep-alive and reconnection are coordinated in one place instead of each
/// consumer opening its own socket. The session closes when the last clone
/// is dropped.
///
/// None of the commands fail: drops, malformed frames and handler panics are
/// absorbed and only show up in [`Client::state`] and in the logs.
///
/// # Examples
///
/// ```rust, no_run
/// use std::time::Duration;
///
/// use groupbuy_live::Client;
/// use groupbuy_live::ws::Handler;
/// use groupbuy_live::ws::config::Config;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Client::new("wss://live.example.com/ws/groups", Config::default())?;
///
///     client.on(
///         "progress_update",
///         Handler::new(|data| println!("progress: {data}")),
///     );
///     client.subscribe_to_topic(42);
///     client.connect();
///
///     tokio::time::sleep(Duration::from_secs(60)).await;
///     client.disconnect();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Configuration for the live connection
    config: Config,
    /// Base endpoint for the WebSocket, without credentials
    endpoint: String,
    /// Connection manager for the WebSocket
    connection: ConnectionManager,
}

impl Client {
    /// Create a client that connects without an auth token.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(endpoint: &str, config: Config) -> Result<Self> {
        Self::with_token_provider(endpoint, config, Anonymous)
    }

    /// Create a client whose connections carry the token from `tokens`.
    ///
    /// The provider is asked for a token on every `connect()` and retry.
    pub fn with_token_provider<T: TokenProvider>(
        endpoint: &str,
        config: Config,
        tokens: T,
    ) -> Result<Self> {
        let connection = ConnectionManager::new(endpoint.to_owned(), &config, tokens)?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                endpoint: endpoint.to_owned(),
                connection,
            }),
        })
    }

    /// Open the session. Does nothing while connecting or connected.
    pub fn connect(&self) {
        self.inner.connection.connect();
    }

    /// Close the session normally and cancel any pending retry or keep-alive.
    pub fn disconnect(&self) {
        self.inner.connection.disconnect();
    }

    /// Make `group_id` the single active topic.
    ///
    /// Sent right away when connected, otherwise on the next open. A previous
    /// topic is unsubscribed first.
    pub fn subscribe_to_topic(&self, group_id: GroupId) {
        self.inner.connection.subscribe_to_topic(group_id);
    }

    /// Drop the active topic, telling the server if connected.
    pub fn unsubscribe_from_topic(&self) {
        self.inner.connection.unsubscribe_from_topic();
    }

    /// Register `handler` for frames of `frame_type`, or for every frame
    /// with [`crate::ws::WILDCARD`].
    ///
    /// Returns `false` if this handler was already registered for the type.
    pub fn on(&self, frame_type: &str, handler: Handler) -> bool {
        self.inner.connection.dispatcher().on(frame_type, handler)
    }

    /// Unregister `handler` from `frame_type`.
    pub fn off(&self, frame_type: &str, handler: &Handler) -> bool {
        self.inner.connection.dispatcher().off(frame_type, handler)
    }

    /// Call `listener` on every state transition, in order.
    ///
    /// Listeners run on the session's driver task and should return quickly.
    pub fn on_state_change<F>(&self, listener: F) -> StateListener
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let registry = self.inner.connection.state_listeners();
        StateListener::new(registry.add(listener), registry)
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Watch connection state changes asynchronously.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state_receiver()
    }

    /// The active topic, as of the last command the session has processed.
    #[must_use]
    pub fn current_topic(&self) -> Option<GroupId> {
        self.inner.connection.current_topic()
    }

    /// Stream of every inbound frame.
    ///
    /// The stream yields [`WsError::Lagged`] and ends if the consumer falls
    /// too far behind.
    pub fn frames(&self) -> impl Stream<Item = Result<Frame>> + use<> {
        let mut rx = self.inner.connection.subscribe();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(frame) => yield frame,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Frame stream lagged, missed {n} messages");
                        Err(WsError::Lagged { count: n })?;
                    }
                    Err(RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }

    /// Stream of inbound frames of a single type.
    pub fn frames_of(&self, frame_type: &str) -> impl Stream<Item = Result<Frame>> + use<> {
        let mut rx = self.inner.connection.subscribe();
        let target = frame_type.to_owned();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if frame.frame_type == target {
                            yield frame;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(frame_type = %target, "Frame stream lagged, missed {n} messages");
                        Err(WsError::Lagged { count: n })?;
                    }
                    Err(RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}
