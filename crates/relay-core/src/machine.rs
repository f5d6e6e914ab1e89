//! Upstream connection state machine.
//!
//! [`UpstreamMachine`] holds the state of one upstream subscription and turns
//! transport events into [`UpstreamAction`]s. It performs no I/O itself, which
//! keeps the reconnect rules testable without a socket.
//!
//! | state        | event           | next         | actions                                |
//! |--------------|-----------------|--------------|----------------------------------------|
//! | Disconnected | start           | Connecting   | Connect                                |
//! | Connecting   | open            | Open         | SendSubscription, StartHeartbeat       |
//! | Open         | subscribed      | Open         | (ready set)                            |
//! | Open         | error           | Open         | (ready cleared, wait for close)        |
//! | Open/Connecting | close        | Connecting   | StopHeartbeat, ScheduleReconnect(d)    |
//! | Connecting   | reconnect timer | Connecting   | Connect                                |
//! | any          | shutdown        | ShuttingDown | CancelTimers, StopHeartbeat, CloseTransport |
//! | ShuttingDown | anything        | ShuttingDown | none (CloseTransport on a late open)   |

use crate::backoff::Backoff;
use std::fmt;
use std::time::Duration;

/// Upstream connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamState {
    /// Not started yet.
    Disconnected,
    /// Connecting, or waiting to reconnect.
    Connecting,
    /// Connected and subscribed.
    Open,
    /// Shut down for good.
    ShuttingDown,
}

impl fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpstreamState::Disconnected => "disconnected",
            UpstreamState::Connecting => "connecting",
            UpstreamState::Open => "open",
            UpstreamState::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

/// Effects the driver must carry out after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamAction {
    /// Open a new transport connection.
    Connect,
    /// Send the subscription handshake.
    SendSubscription,
    /// Start the heartbeat timer.
    StartHeartbeat,
    /// Stop the heartbeat timer.
    StopHeartbeat,
    /// Reconnect after the given delay.
    ScheduleReconnect(Duration),
    /// Cancel any pending reconnect.
    CancelTimers,
    /// Close the transport.
    CloseTransport,
}

/// State of one upstream subscription.
#[derive(Debug, Clone)]
pub struct UpstreamMachine {
    state: UpstreamState,
    ready: bool,
    retry_count: u32,
    backoff: Backoff,
}

impl UpstreamMachine {
    /// Create a machine in the `Disconnected` state.
    #[must_use]
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: UpstreamState::Disconnected,
            ready: false,
            retry_count: 0,
            backoff,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> UpstreamState {
        self.state
    }

    /// True only while open with the subscription handshake sent.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready && self.state == UpstreamState::Open
    }

    /// Failed or closed attempts since the last successful open.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state == UpstreamState::ShuttingDown
    }

    /// Leave `Disconnected` and begin connecting.
    pub fn start(&mut self) -> Vec<UpstreamAction> {
        if self.state != UpstreamState::Disconnected {
            return Vec::new();
        }
        self.state = UpstreamState::Connecting;
        vec![UpstreamAction::Connect]
    }

    /// The transport opened. Readiness waits for [`on_subscribed`](Self::on_subscribed).
    pub fn on_open(&mut self) -> Vec<UpstreamAction> {
        match self.state {
            UpstreamState::ShuttingDown => vec![UpstreamAction::CloseTransport],
            UpstreamState::Connecting => {
                self.state = UpstreamState::Open;
                self.retry_count = 0;
                vec![UpstreamAction::SendSubscription, UpstreamAction::StartHeartbeat]
            }
            UpstreamState::Disconnected | UpstreamState::Open => Vec::new(),
        }
    }

    /// The subscription handshake went out on the open transport.
    pub fn on_subscribed(&mut self) {
        if self.state == UpstreamState::Open {
            self.ready = true;
        }
    }

    /// The transport reported an error.
    ///
    /// Only clears readiness; the close that follows schedules the retry.
    pub fn on_error(&mut self) -> Vec<UpstreamAction> {
        if self.state != UpstreamState::ShuttingDown {
            self.ready = false;
        }
        Vec::new()
    }

    /// The transport closed, or a connect attempt failed.
    pub fn on_close(&mut self) -> Vec<UpstreamAction> {
        match self.state {
            UpstreamState::Open | UpstreamState::Connecting => {
                self.ready = false;
                self.state = UpstreamState::Connecting;
                let delay = self.backoff.delay(self.retry_count);
                self.retry_count = self.retry_count.saturating_add(1);
                vec![
                    UpstreamAction::StopHeartbeat,
                    UpstreamAction::ScheduleReconnect(delay),
                ]
            }
            UpstreamState::Disconnected | UpstreamState::ShuttingDown => Vec::new(),
        }
    }

    /// The reconnect delay elapsed.
    pub fn on_reconnect_timer(&mut self) -> Vec<UpstreamAction> {
        if self.state == UpstreamState::Connecting {
            vec![UpstreamAction::Connect]
        } else {
            Vec::new()
        }
    }

    /// Stop for good.
    pub fn shutdown(&mut self) -> Vec<UpstreamAction> {
        if self.state == UpstreamState::ShuttingDown {
            return Vec::new();
        }
        let was_open = self.state == UpstreamState::Open;
        self.state = UpstreamState::ShuttingDown;
        self.ready = false;

        let mut actions = vec![UpstreamAction::CancelTimers, UpstreamAction::StopHeartbeat];
        if was_open {
            actions.push(UpstreamAction::CloseTransport);
        }
        actions
    }
}

/// The reconnect delay in an action list, if any.
#[must_use]
pub fn reconnect_delay(actions: &[UpstreamAction]) -> Option<Duration> {
    actions.iter().find_map(|action| match action {
        UpstreamAction::ScheduleReconnect(delay) => Some(*delay),
        _ => None,
    })
}
