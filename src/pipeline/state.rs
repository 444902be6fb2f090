// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline lifecycle state

use std::fmt;
use std::sync::Mutex;
use tracing::debug;

/// Position in the capture lifecycle
///
/// `Stopped → Starting → Running → Stopping → Stopped`. `Failed` is entered
/// from `Starting` or `Running` when the session cannot continue; only a
/// full stop/start cycle leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State shared between the control side and the capture thread
#[derive(Debug, Default)]
pub(crate) struct StateCell(Mutex<PipelineState>);

impl StateCell {
    pub(crate) fn get(&self) -> PipelineState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set(&self, next: PipelineState) {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!(from = %*state, to = %next, "Pipeline state change");
            *state = next;
        }
    }

    /// Move to `next` only from `expected`; returns whether it moved.
    ///
    /// This is how the capture thread and the control side agree on who
    /// reports the end of a session.
    pub(crate) fn transition(&self, expected: PipelineState, next: PipelineState) -> bool {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if *state != expected {
            return false;
        }
        debug!(from = %*state, to = %next, "Pipeline state change");
        *state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_requires_expected_state() {
        let cell = StateCell::default();
        assert!(!cell.transition(PipelineState::Running, PipelineState::Failed));
        assert!(cell.transition(PipelineState::Stopped, PipelineState::Starting));
        assert_eq!(cell.get(), PipelineState::Starting);
    }
}
