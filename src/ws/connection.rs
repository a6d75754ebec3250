#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use super::codec::{Frame, GroupId, parse_frame};
use super::config::Config;
use super::dispatcher::{Dispatcher, StateListeners};
use super::heartbeat::spawn_ticker;
use super::session::{Effect, Epoch, Input, Session, TimerId};
use crate::auth::{TokenProvider, endpoint_url};
use crate::error::{Error, Kind};
use crate::Result;

/// Broadcast channel capacity for incoming frames.
const BROADCAST_CAPACITY: usize = 1024;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected, nothing scheduled
    Disconnected,
    /// Transport opening
    Connecting,
    /// Transport open and handshake complete
    Connected,
    /// Waiting for the retry timer after an abnormal drop
    Reconnecting,
    /// Transport could not be constructed, or reconnect attempts are exhausted
    Error,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Everything the driver task reacts to, in arrival order.
pub(crate) enum Event {
    Session(Input),
    Frame { epoch: Epoch, text: Utf8Bytes },
    Shutdown,
}

/// Handle to the single live session.
///
/// Spawns one driver task owning the [`Session`], its transport and its two
/// timers. Commands are queued to that task, so calls never block and are
/// applied in the order they were made.
pub struct ConnectionManager {
    /// Queue into the driver task
    events_tx: mpsc::UnboundedSender<Event>,
    /// Latest connection state, published by the driver
    state_rx: watch::Receiver<ConnectionState>,
    /// Latest topic, published by the driver
    topic_rx: watch::Receiver<Option<GroupId>>,
    /// Broadcast sender for incoming frames
    broadcast_tx: broadcast::Sender<Frame>,
    dispatcher: Arc<Dispatcher>,
    state_listeners: Arc<StateListeners>,
}

impl ConnectionManager {
    /// Create the manager and spawn its driver on the current tokio runtime.
    ///
    /// Nothing is opened until [`ConnectionManager::connect`] is called.
    pub fn new<T: TokenProvider>(endpoint: String, config: &Config, tokens: T) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| Error::with_source(Kind::Internal, e))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (topic_tx, topic_rx) = watch::channel(None);
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let dispatcher = Arc::new(Dispatcher::default());
        let state_listeners = Arc::new(StateListeners::default());

        let driver = Driver {
            endpoint,
            tokens: Box::new(tokens),
            session: Session::new(config),
            events_tx: events_tx.clone(),
            transport: None,
            retry: None,
            keep_alive: None,
            dispatcher: Arc::clone(&dispatcher),
            state_listeners: Arc::clone(&state_listeners),
            state_tx,
            topic_tx,
            broadcast_tx: broadcast_tx.clone(),
        };
        runtime.spawn(driver.run(events_rx));

        Ok(Self {
            events_tx,
            state_rx,
            topic_rx,
            broadcast_tx,
            dispatcher,
            state_listeners,
        })
    }

    /// Open the session unless it is already connecting or connected.
    pub fn connect(&self) {
        self.enqueue(Input::Connect);
    }

    /// Close the session normally, cancelling any pending retry.
    pub fn disconnect(&self) {
        self.enqueue(Input::Disconnect);
    }

    /// Replace the active topic with `group_id`.
    pub fn subscribe_to_topic(&self, group_id: GroupId) {
        self.enqueue(Input::Subscribe(group_id));
    }

    /// Clear the active topic.
    pub fn unsubscribe_from_topic(&self) {
        self.enqueue(Input::Unsubscribe);
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The topic recorded by the driver, as of the last processed command.
    #[must_use]
    pub fn current_topic(&self) -> Option<GroupId> {
        *self.topic_rx.borrow()
    }

    /// Receive every parsed inbound frame.
    ///
    /// Each call returns a new independent receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.broadcast_tx.subscribe()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn state_listeners(&self) -> &Arc<StateListeners> {
        &self.state_listeners
    }

    fn enqueue(&self, input: Input) {
        if self.events_tx.send(Event::Session(input)).is_err() {
            tracing::warn!("Connection driver has stopped, command dropped");
        }
    }
}

impl Drop for ConnectionManager {
    /// Close the session and stop the driver task.
    fn drop(&mut self) {
        _ = self.events_tx.send(Event::Shutdown);
    }
}

/// An open or opening transport owned by the driver.
struct Transport {
    epoch: Epoch,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl Transport {
    /// Ask the transport task to close normally. Dropping `outgoing` afterwards
    /// ends the task even if the close could not be written.
    fn close(self) {
        _ = self.outgoing.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static("client disconnect"),
        })));
    }
}

/// Executes [`Effect`]s produced by the [`Session`].
struct Driver {
    endpoint: String,
    tokens: Box<dyn TokenProvider>,
    session: Session,
    events_tx: mpsc::UnboundedSender<Event>,
    transport: Option<Transport>,
    retry: Option<JoinHandle<()>>,
    keep_alive: Option<JoinHandle<()>>,
    dispatcher: Arc<Dispatcher>,
    state_listeners: Arc<StateListeners>,
    state_tx: watch::Sender<ConnectionState>,
    topic_tx: watch::Sender<Option<GroupId>>,
    broadcast_tx: broadcast::Sender<Frame>,
}

impl Driver {
    async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                Event::Session(input) => self.apply(input),
                Event::Frame { epoch, text } => self.on_frame(epoch, &text),
                Event::Shutdown => {
                    self.apply(Input::Disconnect);
                    break;
                }
            }
        }

        tracing::debug!(state = %self.session.state(), "Connection driver stopped");
    }

    fn apply(&mut self, input: Input) {
        let mut pending = VecDeque::from([input]);
        while let Some(input) = pending.pop_front() {
            for effect in self.session.handle(input) {
                self.execute(effect, &mut pending);
            }
        }

        let topic = self.session.current_topic();
        self.topic_tx.send_if_modified(|current| {
            let changed = *current != topic;
            *current = topic;
            changed
        });
    }

    fn execute(&mut self, effect: Effect, pending: &mut VecDeque<Input>) {
        match effect {
            Effect::Open { epoch } => {
                let token = self.tokens.token();
                match endpoint_url(&self.endpoint, token.as_ref()) {
                    Ok(url) => self.open(epoch, url),
                    Err(e) => pending.push_back(Input::OpenFailed {
                        epoch,
                        reason: e.to_string(),
                    }),
                }
            }
            Effect::CloseTransport { epoch } => {
                if let Some(transport) = self.transport.take_if(|t| t.epoch == epoch) {
                    transport.close();
                }
            }
            Effect::Send(frame) => {
                let Some(transport) = &self.transport else {
                    tracing::warn!(?frame, "Not connected, frame dropped");
                    return;
                };
                match frame.encode() {
                    Ok(json) => {
                        tracing::trace!(%json, "Sending frame");
                        if transport.outgoing.send(Message::Text(json.into())).is_err() {
                            tracing::warn!(?frame, "Transport task gone, frame dropped");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to encode frame"),
                }
            }
            Effect::ArmRetry { timer, delay } => {
                abort(&mut self.retry);
                self.retry = Some(self.spawn_retry(timer, delay));
            }
            Effect::CancelRetry => abort(&mut self.retry),
            Effect::StartKeepAlive { timer, interval } => {
                abort(&mut self.keep_alive);
                self.keep_alive = Some(spawn_ticker(timer, interval, self.events_tx.clone()));
            }
            Effect::StopKeepAlive => abort(&mut self.keep_alive),
            Effect::State(state) => {
                self.state_tx.send_replace(state);
                self.state_listeners.notify(state);
            }
        }
    }

    fn open(&mut self, epoch: Epoch, url: Url) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        if let Some(stale) = self.transport.replace(Transport {
            epoch,
            outgoing: outgoing_tx,
        }) {
            stale.close();
        }

        tracing::debug!(epoch, "Opening transport");
        tokio::spawn(run_transport(
            epoch,
            url,
            self.events_tx.clone(),
            outgoing_rx,
        ));
    }

    fn spawn_retry(&self, timer: TimerId, delay: Duration) -> JoinHandle<()> {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            _ = events_tx.send(Event::Session(Input::RetryElapsed { timer }));
        })
    }

    fn on_frame(&self, epoch: Epoch, text: &str) {
        if !self.session.accepts_frames(epoch) {
            tracing::trace!(epoch, "Ignoring frame from superseded transport");
            return;
        }

        match parse_frame(text.as_bytes()) {
            Ok(frame) => {
                tracing::trace!(frame_type = %frame.frame_type, "Received frame");
                self.dispatcher.dispatch(&frame);
                _ = self.broadcast_tx.send(frame);
            }
            Err(e) => {
                tracing::warn!(%text, error = %e, "Dropping malformed frame");
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        abort(&mut self.retry);
        abort(&mut self.keep_alive);
    }
}

fn abort(handle: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = handle.take() {
        handle.abort();
    }
}

/// Own one WebSocket for its whole life and forward its events to the driver.
async fn run_transport(
    epoch: Epoch,
    url: Url,
    events_tx: mpsc::UnboundedSender<Event>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
) {
    let handshake = connect_async(url.as_str());
    tokio::pin!(handshake);

    // A close queued while the handshake is in flight abandons it.
    let ws_stream = loop {
        tokio::select! {
            biased;

            msg = outgoing_rx.recv() => {
                match msg {
                    Some(Message::Close(_)) | None => {
                        tracing::debug!(epoch, "Transport closed before handshake completed");
                        return;
                    }
                    Some(_) => {
                        tracing::trace!(epoch, "Dropping frame queued before handshake");
                    }
                }
            }

            result = &mut handshake => {
                match result {
                    Ok((ws_stream, _)) => break ws_stream,
                    Err(e) => {
                        let error = Error::from(e);
                        tracing::warn!(epoch, "Unable to connect: {error:?}");
                        _ = events_tx.send(Event::Session(Input::Closed { epoch, code: None }));
                        return;
                    }
                }
            }
        }
    };

    if events_tx
        .send(Event::Session(Input::Opened { epoch }))
        .is_err()
    {
        return;
    }

    let (mut write, mut read) = ws_stream.split();

    let code = loop {
        tokio::select! {
            // Handle incoming messages
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if events_tx.send(Event::Frame { epoch, text }).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| u16::from(f.code));
                    }
                    Some(Ok(_)) => {
                        // Binary frames and ping/pong are not part of the protocol.
                    }
                    Some(Err(e)) => {
                        let error = Error::from(e);
                        tracing::warn!(epoch, "Transport error: {error:?}");
                        break None;
                    }
                    None => break None,
                }
            }

            // Handle outgoing frames from the driver
            msg = outgoing_rx.recv() => {
                match msg {
                    Some(close @ Message::Close(_)) => {
                        // Closure initiated locally; the driver already moved on.
                        _ = write.send(close).await;
                        return;
                    }
                    Some(msg) => {
                        if let Err(e) = write.send(msg).await {
                            let error = Error::from(e);
                            tracing::warn!(epoch, "Failed to write frame: {error:?}");
                            break None;
                        }
                    }
                    None => {
                        _ = write.close().await;
                        return;
                    }
                }
            }
        }
    };

    _ = events_tx.send(Event::Session(Input::Closed { epoch, code }));
}
