//! What a dispatched operation asks the claim loop to do with its ticket.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Store the payload and finish the ticket as `success`.
    Done(Value),
    /// Hand the ticket back to the queue; the message is left undeleted.
    Defer,
    /// Replace the ticket with a fresh one carrying the same request.
    Resubmit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub action: Action,
    /// Seconds to extend the queue message's visibility by before acting.
    pub extend_visibility: Option<u32>,
}

impl Outcome {
    pub fn done(payload: Value) -> Self {
        Self {
            action: Action::Done(payload),
            extend_visibility: None,
        }
    }

    pub fn defer() -> Self {
        Self {
            action: Action::Defer,
            extend_visibility: None,
        }
    }

    pub fn resubmit() -> Self {
        Self {
            action: Action::Resubmit,
            extend_visibility: None,
        }
    }

    pub fn with_timeout(mut self, seconds: u32) -> Self {
        self.extend_visibility = Some(seconds);
        self
    }
}
