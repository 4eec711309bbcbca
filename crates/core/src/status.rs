use crate::{model::ConnectionState, protocol::SessionUpdate};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Sender half of the owner's update stream.
pub type UpdateSender = mpsc::UnboundedSender<SessionUpdate>;

/// Pushes an update to the owner. A dropped receiver is not an error.
pub(crate) fn notify(updates: &UpdateSender, update: SessionUpdate) {
    if updates.send(update).is_err() {
        debug!("Session update dropped: receiver closed.");
    }
}

/// Holds the connection status and enforces its transition edges.
#[derive(Debug)]
pub struct StatusTracker {
    current: Mutex<ConnectionState>,
    updates: UpdateSender,
}

impl StatusTracker {
    pub fn new(updates: UpdateSender) -> Self {
        Self {
            current: Mutex::new(ConnectionState::Idle),
            updates,
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves to `next` if the edge is defined and notifies the owner.
    ///
    /// Returns `false` (and leaves the status untouched) for a self-transition
    /// or an undefined edge.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if *current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            warn!(from = %*current, to = %next, "Rejected status transition");
            return false;
        }
        debug!(from = %*current, to = %next, "Status transition");
        *current = next;
        notify(&self.updates, SessionUpdate::StatusChanged(next));
        true
    }
}
