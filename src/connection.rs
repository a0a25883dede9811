//! Push-channel lifecycle: connect, authenticate, disconnect, reconnect.
//!
//! The manager owns `ConnectionState` exclusively; every other component
//! only reads it. Connection-level failures are absorbed here by the retry
//! policy and never propagate to cache consumers.

use crossbeam::channel::{Receiver, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::WallClock;
use crate::config::ReconnectConfig;
use crate::error::Transience;
use crate::model::{ConversationId, UserId, UserRole};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Authenticated identity announced to the server on every (re)connect so
/// room/subscription state can be rebuilt server-side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub display_name: String,
    pub role: UserRole,
    #[serde(default)]
    pub team: Option<String>,
}

/// Messages the engine sends down the push channel (as opposed to REST
/// requests, which travel the backend-request lane).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    Announce { identity: SessionIdentity },
    JoinRoom { conversation: ConversationId },
    LeaveRoom { conversation: ConversationId },
    MarkRead { conversation: ConversationId },
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("push channel is closed")]
    ChannelClosed,
    #[error("reconnect attempts exhausted after {attempts}")]
    RetriesExhausted { attempts: u32 },
    #[error("handshake completed outside the Connecting state")]
    HandshakeOutOfOrder,
}

impl ConnectionError {
    pub fn transience(&self) -> Transience {
        match self {
            ConnectionError::ChannelClosed => Transience::Retryable,
            ConnectionError::RetriesExhausted { .. } => Transience::Permanent,
            ConnectionError::HandshakeOutOfOrder => Transience::Unknown,
        }
    }
}

/// What to do after an unexpected channel closure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryAfter { delay_ms: u64, attempt: u32 },
    GiveUp,
}

/// Result of a completed handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// True when this session was connected before: callers must assume bulk
    /// caches are stale and re-join any previously joined rooms.
    pub reconnected: bool,
}

/// Receiving half of a state-change subscription; dropping it unsubscribes.
pub struct ConnectionSubscription {
    receiver: Receiver<ConnectionState>,
}

impl ConnectionSubscription {
    pub fn try_recv(&self) -> Result<ConnectionState, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn drain(&self) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(state) = self.receiver.try_recv() {
            states.push(state);
        }
        states
    }
}

pub struct ConnectionManager {
    state: ConnectionState,
    identity: Option<SessionIdentity>,
    reconnect: ReconnectConfig,
    attempts: u32,
    next_retry_at: Option<WallClock>,
    ever_connected: bool,
    outbound: Sender<ChannelMessage>,
    observers: Vec<Sender<ConnectionState>>,
}

impl ConnectionManager {
    /// Returns the manager and the receiving end of the outbound lane the
    /// transport drains.
    pub fn new(reconnect: ReconnectConfig) -> (Self, Receiver<ChannelMessage>) {
        let (outbound, rx) = crossbeam::channel::unbounded();
        let manager = Self {
            state: ConnectionState::Disconnected,
            identity: None,
            reconnect,
            attempts: 0,
            next_retry_at: None,
            ever_connected: false,
            outbound,
            observers: Vec::new(),
        };
        (manager, rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Clone of the outbound sender for components that emit their own
    /// channel messages (chat room guards).
    pub fn outbound_sender(&self) -> Sender<ChannelMessage> {
        self.outbound.clone()
    }

    /// Idempotent: a no-op while `Connected` or `Connecting`. Without an
    /// identity the call fails silently and the state stays `Disconnected`.
    pub fn connect(&mut self, identity: Option<SessionIdentity>) {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                debug!(state = ?self.state, "connect ignored, already in progress");
                return;
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
        }
        let Some(identity) = identity.or_else(|| self.identity.clone()) else {
            warn!("connect skipped: no identity available");
            return;
        };
        self.identity = Some(identity);
        self.attempts = 0;
        self.next_retry_at = None;
        self.set_state(ConnectionState::Connecting);
    }

    /// The transport finished its handshake: announce identity and go
    /// `Connected`.
    pub fn handshake_complete(&mut self) -> Result<Handshake, ConnectionError> {
        if self.state != ConnectionState::Connecting {
            debug!(state = ?self.state, "handshake ignored outside Connecting");
            return Err(ConnectionError::HandshakeOutOfOrder);
        }
        let identity = self
            .identity
            .clone()
            .ok_or(ConnectionError::HandshakeOutOfOrder)?;
        self.send(ChannelMessage::Announce { identity })?;

        let reconnected = self.ever_connected;
        self.ever_connected = true;
        self.attempts = 0;
        self.next_retry_at = None;
        self.set_state(ConnectionState::Connected);
        info!(reconnected, "push channel connected");
        Ok(Handshake { reconnected })
    }

    /// Deterministic teardown: observers are dropped before the state flips,
    /// so no handler fires against a dead session. Explicit disconnect never
    /// triggers reconnection.
    pub fn disconnect(&mut self) {
        self.observers.clear();
        self.state = ConnectionState::Disconnected;
        self.identity = None;
        self.attempts = 0;
        self.next_retry_at = None;
        info!("push channel disconnected");
    }

    /// The channel dropped unexpectedly. Schedules a capped-exponential
    /// retry with jitter, bounded by `max_attempts`.
    pub fn channel_closed(&mut self, now: WallClock) -> ReconnectDecision {
        if self.state == ConnectionState::Disconnected {
            return ReconnectDecision::GiveUp;
        }
        self.attempts += 1;
        if self.attempts > self.reconnect.max_attempts {
            warn!(attempts = self.attempts - 1, "reconnect attempts exhausted");
            self.set_state(ConnectionState::Disconnected);
            return ReconnectDecision::GiveUp;
        }
        let delay_ms = with_jitter(backoff_ceiling_ms(&self.reconnect, self.attempts));
        self.next_retry_at = Some(now.saturating_add_ms(delay_ms));
        self.set_state(ConnectionState::Reconnecting);
        debug!(attempt = self.attempts, delay_ms, "reconnect scheduled");
        ReconnectDecision::RetryAfter {
            delay_ms,
            attempt: self.attempts,
        }
    }

    /// Whether the scheduled retry delay has elapsed.
    pub fn retry_due(&self, now: WallClock) -> bool {
        self.state == ConnectionState::Reconnecting
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Move a due retry into `Connecting`; the transport then dials again.
    pub fn begin_retry(&mut self, now: WallClock) -> bool {
        if !self.retry_due(now) {
            return false;
        }
        self.next_retry_at = None;
        self.set_state(ConnectionState::Connecting);
        true
    }

    pub fn subscribe(&mut self) -> ConnectionSubscription {
        let (sender, receiver) = crossbeam::channel::bounded(32);
        self.observers.push(sender);
        ConnectionSubscription { receiver }
    }

    fn send(&self, message: ChannelMessage) -> Result<(), ConnectionError> {
        self.outbound
            .send(message)
            .map_err(|_| ConnectionError::ChannelClosed)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.observers.retain(|sender| {
            match sender.try_send(state) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

/// Un-jittered delay for the given attempt (1-based): base doubled per
/// attempt, capped at `backoff_max_ms`.
pub fn backoff_ceiling_ms(cfg: &ReconnectConfig, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(16);
    cfg.backoff_base_ms
        .saturating_mul(1u64 << shift)
        .min(cfg.backoff_max_ms)
}

fn with_jitter(ms: u64) -> u64 {
    use rand::Rng;
    let mut rng = rand::rng();
    // +/- 25%.
    ms.saturating_mul(rng.random_range(75..=125)) / 100
}
