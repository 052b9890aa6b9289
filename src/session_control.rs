// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running,
    CancelRequested,
    Stopped,
}

/// The only mutable state shared between a running session and the outside
/// world. The session polls it at its wait and poll boundaries; anyone
/// holding a clone may request cancellation.
#[derive(Clone, Debug)]
pub struct SessionController {
    state: Arc<Mutex<RunState>>,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    pub fn new() -> Self {
        SessionController{state: Arc::new(Mutex::new(RunState::Running))}
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state() == RunState::CancelRequested
    }

    // Has no effect once the session has stopped.
    pub fn request_cancel(&self) {
        let mut locked_state = self.state.lock().unwrap();
        if *locked_state == RunState::Running {
            *locked_state = RunState::CancelRequested;
        }
    }

    pub fn mark_stopped(&self) {
        *self.state.lock().unwrap() = RunState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let controller = SessionController::new();
        assert!(controller.is_running());

        let other = controller.clone();
        other.request_cancel();
        assert!(controller.is_cancel_requested());
        assert!(!controller.is_running());

        controller.mark_stopped();
        assert_eq!(other.state(), RunState::Stopped);

        // Cancelling a stopped session leaves it stopped.
        other.request_cancel();
        assert_eq!(controller.state(), RunState::Stopped);
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let controller = SessionController::new();
        let cloned = controller.clone();
        std::thread::spawn(move || cloned.request_cancel()).join().unwrap();
        assert!(controller.is_cancel_requested());
    }

}  // mod tests.
