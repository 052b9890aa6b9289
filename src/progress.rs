// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Preparing,
    Calibrating,
    ProcessingWorkItems,
    Completing,
    Finished,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Failed { message: String },
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Completed => write!(f, "Session Ended"),
            SessionOutcome::Cancelled => write!(f, "Session Cancelled"),
            SessionOutcome::Failed{message} => write!(f, "Session Failed: {}", message),
        }
    }
}

/// Everything an observer of a running session is told.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    // A line for the session console. `indent` is a nesting level, not a
    // character count.
    ConsoleLine { text: String, indent: u32 },
    WorkItemStarted { index: usize },
    ProgressStarted { maximum: u32 },
    ProgressUpdated { value: u32 },
    ProgressFinished,
    FramesCompleted { index: usize, completed: u32 },
    Finished(SessionOutcome),
}

/// Sending side of the session event channel. Sends never block; if the
/// observer has gone away events are dropped.
#[derive(Clone, Debug)]
pub struct EventSink {
    sender: UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(sender: UnboundedSender<SessionEvent>) -> Self {
        EventSink{sender}
    }

    /// A sink and the receiver observing it.
    pub fn channel() -> (Self, UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (EventSink{sender}, receiver)
    }

    pub fn send(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn console(&self, text: impl Into<String>, indent: u32) {
        self.send(SessionEvent::ConsoleLine{text: text.into(), indent});
    }

    pub fn state(&self, state: SessionState) {
        self.send(SessionEvent::StateChanged(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_delivered_in_order() {
        let (sink, mut receiver) = EventSink::channel();
        sink.state(SessionState::Preparing);
        sink.console("Hello", 1);
        sink.send(SessionEvent::ProgressStarted{maximum: 4});
        assert_eq!(receiver.try_recv().unwrap(),
                   SessionEvent::StateChanged(SessionState::Preparing));
        assert_eq!(receiver.try_recv().unwrap(),
                   SessionEvent::ConsoleLine{text: "Hello".to_string(), indent: 1});
        assert_eq!(receiver.try_recv().unwrap(),
                   SessionEvent::ProgressStarted{maximum: 4});
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_closed_receiver_ignored() {
        let (sink, receiver) = EventSink::channel();
        drop(receiver);
        sink.console("Nobody listening", 0);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(SessionOutcome::Completed.to_string(), "Session Ended");
        assert_eq!(SessionOutcome::Cancelled.to_string(), "Session Cancelled");
        assert_eq!(SessionOutcome::Failed{message: "Camera Aborted".to_string()}
                   .to_string(), "Session Failed: Camera Aborted");
    }

}  // mod tests.
