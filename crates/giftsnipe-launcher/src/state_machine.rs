/*
[INPUT]:  MarketState, MarketAction
[OUTPUT]: Validated state transitions for supervised market processes
[POS]:    Supervision domain logic - per-market lifecycle
[UPDATE]: When market states or transitions change
*/

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Why a market sits in Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NotStarted,
    Requested,
    ConfigError,
    PolicyExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketState {
    Stopped(StopReason),
    Starting,
    Running,
    Crashed,
    Restarting,
}

impl MarketState {
    /// Stopped for any reason other than never having started
    pub fn is_terminal(self) -> bool {
        matches!(self, MarketState::Stopped(reason) if reason != StopReason::NotStarted)
    }

    pub fn is_live(self) -> bool {
        matches!(self, MarketState::Starting | MarketState::Running)
    }
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketState::Stopped(StopReason::NotStarted) => f.write_str("stopped"),
            MarketState::Stopped(StopReason::Requested) => f.write_str("stopped(requested)"),
            MarketState::Stopped(StopReason::ConfigError) => f.write_str("stopped(config_error)"),
            MarketState::Stopped(StopReason::PolicyExhausted) => {
                f.write_str("stopped(policy_exhausted)")
            }
            MarketState::Starting => f.write_str("starting"),
            MarketState::Running => f.write_str("running"),
            MarketState::Crashed => f.write_str("crashed"),
            MarketState::Restarting => f.write_str("restarting"),
        }
    }
}

/// Events that move a market between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketAction {
    Start,
    /// Survived the liveness grace period
    ConfirmLive,
    /// Exited without being asked to
    Crash,
    /// Exited after the launcher asked it to
    RequestedExit,
    /// Exited with the configuration-error code
    ConfigExit,
    ScheduleRestart,
    GiveUp,
    /// Shutdown while no process is running
    Stop,
}

#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("Invalid transition: {from:?} -> {action:?}")]
    InvalidTransition {
        from: MarketState,
        action: MarketAction,
    },
}

fn next_state(from: MarketState, action: MarketAction) -> Option<MarketState> {
    use MarketAction as A;
    use MarketState as S;

    match (from, action) {
        (S::Stopped(StopReason::NotStarted), A::Start) | (S::Restarting, A::Start) => {
            Some(S::Starting)
        }
        (S::Starting, A::ConfirmLive) => Some(S::Running),
        (S::Starting | S::Running, A::Crash) => Some(S::Crashed),
        (S::Starting | S::Running, A::RequestedExit) => Some(S::Stopped(StopReason::Requested)),
        (S::Starting | S::Running, A::ConfigExit) => Some(S::Stopped(StopReason::ConfigError)),
        (S::Crashed, A::ScheduleRestart) => Some(S::Restarting),
        (S::Crashed, A::GiveUp) => Some(S::Stopped(StopReason::PolicyExhausted)),
        (S::Stopped(StopReason::NotStarted) | S::Crashed | S::Restarting, A::Stop) => {
            Some(S::Stopped(StopReason::Requested))
        }
        _ => None,
    }
}

/// Lifecycle of one supervised market
#[derive(Debug, Clone)]
pub struct MarketStateMachine {
    current_state: MarketState,
}

impl Default for MarketStateMachine {
    fn default() -> Self {
        Self::new(MarketState::Stopped(StopReason::NotStarted))
    }
}

impl MarketStateMachine {
    pub fn new(initial: MarketState) -> Self {
        Self {
            current_state: initial,
        }
    }

    pub fn can_transition(&self, action: MarketAction) -> bool {
        next_state(self.current_state, action).is_some()
    }

    /// Apply `action`, returning the new state.
    pub fn transition(&mut self, action: MarketAction) -> Result<MarketState, StateError> {
        let next = next_state(self.current_state, action).ok_or(StateError::InvalidTransition {
            from: self.current_state,
            action,
        })?;
        self.current_state = next;
        Ok(next)
    }

    pub fn state(&self) -> MarketState {
        self.current_state
    }
}
