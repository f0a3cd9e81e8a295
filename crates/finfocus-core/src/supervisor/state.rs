//! Plugin process state machine and its change notifications.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Lifecycle of one plugin process.
///
/// ```text
/// starting    -> handshaking
/// handshaking -> ready | crashed | stopped
/// ready       -> degraded | crashed | stopped
/// degraded    -> ready | crashed | stopped
/// ```
///
/// `crashed` and `stopped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Handshaking,
    Ready,
    /// Ready, but the last call hit a transport fault.
    Degraded,
    Crashed,
    Stopped,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Crashed | Self::Stopped)
    }

    pub fn is_valid_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Starting, Self::Handshaking)
                | (Self::Starting, Self::Crashed)
                | (Self::Starting, Self::Stopped)
                | (Self::Handshaking, Self::Ready)
                | (Self::Handshaking, Self::Crashed)
                | (Self::Handshaking, Self::Stopped)
                | (Self::Ready, Self::Degraded)
                | (Self::Ready, Self::Crashed)
                | (Self::Ready, Self::Stopped)
                | (Self::Degraded, Self::Ready)
                | (Self::Degraded, Self::Crashed)
                | (Self::Degraded, Self::Stopped)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl FromStr for ProcessState {
    type Err = ProcessStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "handshaking" => Ok(Self::Handshaking),
            "ready" => Ok(Self::Ready),
            "degraded" => Ok(Self::Degraded),
            "crashed" => Ok(Self::Crashed),
            "stopped" => Ok(Self::Stopped),
            other => Err(ProcessStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ProcessState`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid process state: {0:?}")]
pub struct ProcessStateParseError(pub String);

/// Published on the supervisor's broadcast channel for every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// `name@version` of the process.
    pub plugin: String,
    pub pid: Option<u32>,
    pub from: ProcessState,
    pub to: ProcessState,
}

/// State cell shared by a process handle and its monitor task.
#[derive(Debug)]
pub(crate) struct StateCell {
    plugin: String,
    pid: Option<u32>,
    state: watch::Sender<ProcessState>,
    events: broadcast::Sender<StateChange>,
}

impl StateCell {
    pub(crate) fn new(
        plugin: String,
        pid: Option<u32>,
        events: broadcast::Sender<StateChange>,
    ) -> Self {

        let (state, _) = watch::channel(ProcessState::Starting);
        Self {
            plugin,
            pid,
            state,
            events,
        }
    }

    pub(crate) fn get(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// Apply `to` if it is a valid edge from the current state. Returns
    /// whether the state changed.
    pub(crate) fn transition(&self, to: ProcessState) -> bool {
        let mut from = to;
        let changed = self.state.send_if_modified(|current| {
            if ProcessState::is_valid_transition(*current, to) {
                from = *current;
                *current = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(plugin = %self.plugin, pid = ?self.pid, %from, %to, "plugin state changed");
            // No subscribers is fine.
            let _ = self.events.send(StateChange {
                plugin: self.plugin.clone(),
                pid: self.pid,
                from,
                to,
            });
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_sticky() {
        for terminal in [ProcessState::Crashed, ProcessState::Stopped] {
            for to in [
                ProcessState::Starting,
                ProcessState::Handshaking,
                ProcessState::Ready,
                ProcessState::Degraded,
                ProcessState::Crashed,
                ProcessState::Stopped,
            ] {
                assert!(!ProcessState::is_valid_transition(terminal, to), "{terminal} -> {to}");
            }
        }
    }

    #[test]
    fn transition_publishes_change() {
        let (tx, mut rx) = broadcast::channel(8);
        let cell = StateCell::new("aws@1.0.0".into(), Some(42), tx);

        assert!(cell.transition(ProcessState::Handshaking));
        assert!(cell.transition(ProcessState::Ready));
        assert!(!cell.transition(ProcessState::Handshaking));
        assert_eq!(cell.get(), ProcessState::Ready);

        let first = rx.try_recv().unwrap();
        assert_eq!((first.from, first.to), (ProcessState::Starting, ProcessState::Handshaking));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.to, ProcessState::Ready);
        assert_eq!(second.pid, Some(42));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn degraded_recovers_to_ready() {
        let (tx, _rx) = broadcast::channel(8);
        let cell = StateCell::new("p".into(), None, tx);
        cell.transition(ProcessState::Handshaking);
        cell.transition(ProcessState::Ready);
        assert!(cell.transition(ProcessState::Degraded));
        assert!(cell.transition(ProcessState::Ready));
    }

    #[test]
    fn display_round_trips() {
        for state in [ProcessState::Ready, ProcessState::Crashed] {
            assert_eq!(state.to_string().parse::<ProcessState>().unwrap(), state);
        }
    }
}
