//! Connection lifecycle as a pure state machine.
//!
//! [`Session::handle`] consumes one [`Input`] at a time and returns the
//! [`Effect`]s the connection driver has to carry out, in order. The session
//! never touches sockets or timers itself, which keeps every transition
//! deterministic and linearised through the driver's single event queue.
//!
//! Transports are identified by an epoch and timers by an id; inputs that
//! refer to a superseded epoch or a cancelled timer are ignored.

use std::time::Duration;

use super::codec::{ControlFrame, GroupId};
use super::config::Config;
use super::connection::ConnectionState;
use super::heartbeat::KeepAlive;
use super::reconnect::{ReconnectPolicy, Retry};
use super::topic::TopicRegistry;

/// Identifies one transport instance.
pub(crate) type Epoch = u64;
/// Identifies one armed timer.
pub(crate) type TimerId = u64;

/// WebSocket close code for a normal, intentional closure.
pub(crate) const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Input {
    Connect,
    Disconnect,
    Subscribe(GroupId),
    Unsubscribe,
    /// The transport of `epoch` completed its opening handshake.
    Opened { epoch: Epoch },
    /// The transport of `epoch` could not even be constructed.
    OpenFailed { epoch: Epoch, reason: String },
    /// The transport of `epoch` closed or failed. `None` means no close frame.
    Closed { epoch: Epoch, code: Option<u16> },
    RetryElapsed { timer: TimerId },
    KeepAliveTick { timer: TimerId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Open a new transport tagged with `epoch`.
    Open { epoch: Epoch },
    /// Close the transport of `epoch` normally and release it.
    CloseTransport { epoch: Epoch },
    /// Write a control frame on the current transport.
    Send(ControlFrame),
    ArmRetry { timer: TimerId, delay: Duration },
    CancelRetry,
    StartKeepAlive { timer: TimerId, interval: Duration },
    StopKeepAlive,
    /// Notify observers of a state transition.
    State(ConnectionState),
}

#[derive(Debug)]
pub(crate) struct Session {
    state: ConnectionState,
    transport: Option<Epoch>,
    next_epoch: Epoch,
    next_timer: TimerId,
    retry_timer: Option<TimerId>,
    policy: ReconnectPolicy,
    keep_alive: KeepAlive,
    topics: TopicRegistry,
}

impl Session {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            transport: None,
            next_epoch: 0,
            next_timer: 0,
            retry_timer: None,
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            keep_alive: KeepAlive::new(config.keep_alive_interval),
            topics: TopicRegistry::default(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn current_topic(&self) -> Option<GroupId> {
        self.topics.current()
    }

    /// Whether inbound frames from `epoch` should be delivered.
    pub(crate) fn accepts_frames(&self, epoch: Epoch) -> bool {
        self.state.is_connected() && self.transport == Some(epoch)
    }

    pub(crate) fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut fx = Vec::new();

        match input {
            Input::Connect => self.connect(&mut fx),
            Input::Disconnect => self.disconnect(&mut fx),
            Input::Subscribe(group_id) => {
                let connected = self.state.is_connected();
                let frames = self.topics.subscribe(group_id, connected);
                if connected {
                    tracing::debug!(group_id, "Subscribing to group");
                } else {
                    tracing::warn!(group_id, "Not connected, subscription deferred until open");
                }
                fx.extend(frames.into_iter().map(Effect::Send));
            }
            Input::Unsubscribe => {
                let previous = self.topics.current();
                if let Some(frame) = self.topics.unsubscribe(self.state.is_connected()) {
                    fx.push(Effect::Send(frame));
                }
                tracing::debug!(group_id = ?previous, "Cleared group subscription");
            }
            Input::Opened { epoch } => self.opened(epoch, &mut fx),
            Input::OpenFailed { epoch, reason } => {
                if self.transport != Some(epoch) || self.state != ConnectionState::Connecting {
                    return fx;
                }
                tracing::warn!(epoch, %reason, "Unable to construct transport");
                self.transport = None;
                self.transition(ConnectionState::Error, &mut fx);
                self.schedule_retry(&mut fx);
            }
            Input::Closed { epoch, code } => self.closed(epoch, code, &mut fx),
            Input::RetryElapsed { timer } => {
                if self.retry_timer != Some(timer) {
                    return fx;
                }
                self.retry_timer = None;
                self.policy.clear_pending();
                if matches!(
                    self.state,
                    ConnectionState::Reconnecting | ConnectionState::Error
                ) {
                    tracing::debug!(attempt = self.policy.attempt(), "Retrying connection");
                    self.open(&mut fx);
                }
            }
            Input::KeepAliveTick { timer } => {
                if self.keep_alive.is_current(timer) && self.state.is_connected() {
                    fx.push(Effect::Send(ControlFrame::Ping));
                }
            }
        }

        fx
    }

    fn connect(&mut self, fx: &mut Vec<Effect>) {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Error => {
                // A manual connect starts over, including after exhaustion.
                self.cancel_retry(fx);
                self.policy.reset();
                self.open(fx);
            }
            state => {
                tracing::debug!(%state, "Connect ignored, session already active");
            }
        }
    }

    fn disconnect(&mut self, fx: &mut Vec<Effect>) {
        self.cancel_retry(fx);
        self.stop_keep_alive(fx);
        if let Some(epoch) = self.transport.take() {
            fx.push(Effect::CloseTransport { epoch });
        }
        self.transition(ConnectionState::Disconnected, fx);
    }

    fn opened(&mut self, epoch: Epoch, fx: &mut Vec<Effect>) {
        if self.transport != Some(epoch) || self.state != ConnectionState::Connecting {
            tracing::trace!(epoch, "Ignoring open from superseded transport");
            return;
        }

        self.policy.reset();
        self.transition(ConnectionState::Connected, fx);

        let timer = self.timer_id();
        if self.keep_alive.start(timer) {
            fx.push(Effect::StopKeepAlive);
        }
        fx.push(Effect::StartKeepAlive {
            timer,
            interval: self.keep_alive.interval(),
        });

        if let Some(frame) = self.topics.replay() {
            tracing::debug!(group_id = ?self.topics.current(), "Re-asserting group subscription");
            fx.push(Effect::Send(frame));
        }
    }

    fn closed(&mut self, epoch: Epoch, code: Option<u16>, fx: &mut Vec<Effect>) {
        if self.transport != Some(epoch) {
            // Already handled, e.g. an error followed by a close for the same drop.
            return;
        }
        self.transport = None;
        fx.push(Effect::CloseTransport { epoch });
        self.stop_keep_alive(fx);

        if code == Some(NORMAL_CLOSURE) {
            tracing::debug!(epoch, "Transport closed normally");
            self.transition(ConnectionState::Disconnected, fx);
        } else {
            tracing::warn!(epoch, code = ?code, "Transport dropped abnormally");
            self.transition(ConnectionState::Reconnecting, fx);
            self.schedule_retry(fx);
        }
    }

    fn open(&mut self, fx: &mut Vec<Effect>) {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.transport = Some(epoch);
        self.transition(ConnectionState::Connecting, fx);
        fx.push(Effect::Open { epoch });
    }

    fn schedule_retry(&mut self, fx: &mut Vec<Effect>) {
        match self.policy.schedule_retry() {
            Retry::Scheduled { attempt, delay } => {
                let timer = self.timer_id();
                self.retry_timer = Some(timer);
                tracing::debug!(attempt, ?delay, "Scheduling reconnect");
                fx.push(Effect::ArmRetry { timer, delay });
            }
            Retry::AlreadyPending => {
                tracing::trace!("Reconnect already pending");
            }
            Retry::Exhausted => {
                tracing::error!(
                    attempts = self.policy.attempt(),
                    "Reconnect attempts exhausted, call connect() to try again"
                );
                self.transition(ConnectionState::Error, fx);
            }
        }
    }

    fn cancel_retry(&mut self, fx: &mut Vec<Effect>) {
        if self.retry_timer.take().is_some() {
            self.policy.clear_pending();
            fx.push(Effect::CancelRetry);
        }
    }

    fn stop_keep_alive(&mut self, fx: &mut Vec<Effect>) {
        if self.keep_alive.stop() {
            fx.push(Effect::StopKeepAlive);
        }
    }

    fn transition(&mut self, next: ConnectionState, fx: &mut Vec<Effect>) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = %self.state, to = %next, "Connection state changed");
        self.state = next;
        fx.push(Effect::State(next));
    }

    fn timer_id(&mut self) -> TimerId {
        let id = self.next_timer;
        self.next_timer += 1;
        id
    }

    #[cfg(test)]
    fn attempt(&self) -> u32 {
        self.policy.attempt()
    }

    #[cfg(test)]
    fn retry_pending(&self) -> bool {
        self.retry_timer.is_some()
    }

    #[cfg(test)]
    fn keep_alive_running(&self) -> bool {
        self.keep_alive.is_running()
    }
}
