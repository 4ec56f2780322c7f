//! Pure supervisor state machine and retry policy
//!
//! All transition and backoff decisions are pure functions so they can be
//! tested without a runtime. The supervisor task feeds events in and applies
//! the resulting state.

use crate::pool::Endpoint;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Connection supervisor states
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SupervisorState {
    /// Not started, or stopped
    Idle,
    /// Attempting to connect to this endpoint
    Connecting(Endpoint),
    /// Session established with this endpoint
    Connected(Endpoint),
    /// Session with this endpoint was lost
    Disconnected { endpoint: Endpoint, reason: String },
    /// Every endpoint failed in the last pass; waiting before the next one
    Exhausted { passes: u32, retry_in: Duration },
}

impl SupervisorState {
    /// Publishing directly is only attempted while connected
    pub fn can_publish(&self) -> bool {
        matches!(self, SupervisorState::Connected(_))
    }

    pub fn is_connected(&self) -> bool {
        self.can_publish()
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            SupervisorState::Connecting(endpoint)
            | SupervisorState::Connected(endpoint)
            | SupervisorState::Disconnected { endpoint, .. } => Some(endpoint),
            SupervisorState::Idle | SupervisorState::Exhausted { .. } => None,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Idle => write!(f, "idle"),
            SupervisorState::Connecting(endpoint) => write!(f, "connecting to {endpoint}"),
            SupervisorState::Connected(endpoint) => write!(f, "connected to {endpoint}"),
            SupervisorState::Disconnected { endpoint, reason } => {
                write!(f, "disconnected from {endpoint}: {reason}")
            }
            SupervisorState::Exhausted { passes, retry_in } => {
                write!(f, "all brokers unreachable ({passes} passes), retrying in {retry_in:?}")
            }
        }
    }
}

/// Events that drive supervisor state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// `start()` or a retry pass begins at this endpoint
    AttemptStarted(Endpoint),
    /// The current attempt's broker accepted the session
    ConnectSucceeded,
    /// The current attempt failed; the next candidate is given
    AttemptFailed { next: Endpoint },
    /// A full pass over the pool failed
    PassExhausted { passes: u32, retry_in: Duration },
    /// The live session ended (broker drop, network error or failed resubscribe)
    ConnectionLost(String),
    /// `stop()` was called
    Stopped,
}

/// Reconnection policy applied after a full failed pass over the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Escalating delays in milliseconds, one per consecutive failed pass
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: Vec::new(),
            sustained_delay: 5000, // Fixed 5 s between passes
        }
    }
}

impl ReconnectConfig {
    /// Calculate backoff delay after the given failed pass (1-based)
    pub fn calculate_backoff_delay(&self, pass: u32) -> u64 {
        let index = pass.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Decision result after a failed pass
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Sleep, then start another pass
    Proceed { pass: u32, delay_ms: u64 },
    /// Shutdown requested, stop trying
    AbortShutdownRequested,
}

/// Pure supervisor decision logic
pub struct Supervision;

impl Supervision {
    /// Decide what to do after `failed_passes` consecutive failed passes.
    /// There is no attempt limit; only shutdown ends the loop.
    pub fn should_retry_pass(
        failed_passes: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        ReconnectionDecision::Proceed {
            pass: failed_passes,
            delay_ms: config.calculate_backoff_delay(failed_passes),
        }
    }

    /// Determine next state after a connection event (pure function)
    pub fn determine_next_state(
        current: &SupervisorState,
        event: ConnectionEvent,
    ) -> SupervisorState {
        match event {
            ConnectionEvent::AttemptStarted(endpoint) => SupervisorState::Connecting(endpoint),
            ConnectionEvent::AttemptFailed { next } => SupervisorState::Connecting(next),
            ConnectionEvent::ConnectSucceeded => match current {
                SupervisorState::Connecting(endpoint) => SupervisorState::Connected(endpoint.clone()),
                other => other.clone(),
            },
            ConnectionEvent::PassExhausted { passes, retry_in } => {
                SupervisorState::Exhausted { passes, retry_in }
            }
            ConnectionEvent::ConnectionLost(reason) => match current {
                SupervisorState::Connected(endpoint) => SupervisorState::Disconnected {
                    endpoint: endpoint.clone(),
                    reason,
                },
                other => other.clone(),
            },
            ConnectionEvent::Stopped => SupervisorState::Idle,
        }
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &SupervisorState, to: &SupervisorState) {
        match (from, to) {
            (SupervisorState::Connecting(_), SupervisorState::Connected(endpoint)) => {
                info!(endpoint = %endpoint, "Connected to broker");
            }
            (SupervisorState::Connected(_), SupervisorState::Disconnected { endpoint, reason }) => {
                warn!(endpoint = %endpoint, "Connection lost: {}", reason);
            }
            (SupervisorState::Connecting(failed), SupervisorState::Connecting(next)) => {
                warn!(failed = %failed, next = %next, "Broker unreachable, trying next");
            }
            (_, SupervisorState::Exhausted { passes, retry_in }) => {
                error!(
                    passes = passes,
                    "No broker reachable, retrying in {:?}", retry_in
                );
            }
            (_, SupervisorState::Idle) => {
                info!("Supervisor stopped");
            }
            _ => {
                info!("Supervisor state: {} -> {}", from, to);
            }
        }
    }
}
