use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use super::connection::Event;
use super::session::{Input, TimerId};

/// Bookkeeping for the one-way keep-alive while the session is connected.
///
/// Only tracks which ticker is current; the ticker task itself lives in the
/// connection driver.
#[derive(Debug)]
pub(crate) struct KeepAlive {
    interval: Duration,
    active: Option<TimerId>,
}

impl KeepAlive {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            active: None,
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    /// Mark `timer` as the running ticker. Returns `true` when a previous
    /// ticker was still registered and has to be stopped first.
    pub(crate) fn start(&mut self, timer: TimerId) -> bool {
        self.active.replace(timer).is_some()
    }

    /// Returns `true` when a ticker was running.
    pub(crate) fn stop(&mut self) -> bool {
        self.active.take().is_some()
    }

    pub(crate) fn is_current(&self, timer: TimerId) -> bool {
        self.active == Some(timer)
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.active.is_some()
    }
}

/// Spawn a ticker that feeds [`Input::KeepAliveTick`] into the driver queue.
///
/// The first tick fires one full interval after start.
pub(crate) fn spawn_ticker(
    timer: TimerId,
    period: Duration,
    events: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(start) = Instant::now().checked_add(period) else {
            tracing::error!(?period, "Keep-alive interval out of range, ticker not started");
            return;
        };
        let mut ticks = interval_at(start, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;
            if events
                .send(Event::Session(Input::KeepAliveTick { timer }))
                .is_err()
            {
                // Driver has shut down
                break;
            }
        }
    })
}
