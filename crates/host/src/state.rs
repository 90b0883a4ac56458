//! Launch state machine
//!
//! ```text
//! Init -> Spawned  -> StoppedAtEntry -> Patched -> Running
//!      -> Hijacked ->
//! ```
//!
//! Every non-terminal state may also move to `Failed`.

use hbldr_common::{create_logger, log_detail, log_fail, Error, Logger, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Init,
    Spawned,
    Hijacked,
    StoppedAtEntry,
    Patched,
    Running,
    Failed,
}

impl LaunchState {
    pub fn name(self) -> &'static str {
        match self {
            LaunchState::Init => "init",
            LaunchState::Spawned => "spawned",
            LaunchState::Hijacked => "hijacked",
            LaunchState::StoppedAtEntry => "stopped-at-entry",
            LaunchState::Patched => "patched",
            LaunchState::Running => "running",
            LaunchState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LaunchState::Running | LaunchState::Failed)
    }

    pub fn can_advance_to(self, next: LaunchState) -> bool {
        use LaunchState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Init, Spawned) | (Init, Hijacked) => true,
            (Spawned, StoppedAtEntry) | (Hijacked, StoppedAtEntry) => true,
            (StoppedAtEntry, Patched) => true,
            (Patched, Running) => true,
            _ => false,
        }
    }
}

/// Tracks one launch through its states.
pub struct Launch {
    state: LaunchState,
    log: Logger,
}

impl Default for Launch {
    fn default() -> Self {
        Self::new()
    }
}

impl Launch {
    pub fn new() -> Self {
        Self { state: LaunchState::Init, log: create_logger("engine") }
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    pub fn advance(&mut self, next: LaunchState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::InvalidState { from: self.state.name(), to: next.name() });
        }
        log_detail!(self.log, "{} -> {}", self.state.name(), next.name());
        self.state = next;
        Ok(())
    }

    /// Record a failure. A launch that already finished keeps its state.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            log_fail!(self.log, "launch failed in state {}", self.state.name());
            self.state = LaunchState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_path() {
        let mut launch = Launch::new();
        for next in [LaunchState::Spawned, LaunchState::StoppedAtEntry, LaunchState::Patched, LaunchState::Running] {
            launch.advance(next).unwrap();
        }
        assert_eq!(launch.state(), LaunchState::Running);
    }

    #[test]
    fn test_hijack_path() {
        let mut launch = Launch::new();
        launch.advance(LaunchState::Hijacked).unwrap();
        launch.advance(LaunchState::StoppedAtEntry).unwrap();
        assert_eq!(launch.state(), LaunchState::StoppedAtEntry);
    }

    #[test]
    fn test_skipping_states_rejected() {
        let mut launch = Launch::new();
        let err = launch.advance(LaunchState::Patched).unwrap_err();
        assert!(matches!(err, Error::InvalidState { from: "init", to: "patched" }));
        assert_eq!(launch.state(), LaunchState::Init);
    }

    #[test]
    fn test_failure_from_any_live_state() {
        let mut launch = Launch::new();
        launch.advance(LaunchState::Spawned).unwrap();
        launch.fail();
        assert_eq!(launch.state(), LaunchState::Failed);
        assert!(launch.advance(LaunchState::StoppedAtEntry).is_err());

        let mut launch = Launch::new();
        for next in [LaunchState::Hijacked, LaunchState::StoppedAtEntry, LaunchState::Patched, LaunchState::Running] {
            launch.advance(next).unwrap();
        }
        launch.fail();
        assert_eq!(launch.state(), LaunchState::Running);
        assert!(!LaunchState::Running.can_advance_to(LaunchState::Failed));
    }
}
