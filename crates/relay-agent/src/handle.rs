//! Cloneable sender side of the controller loop

use relay_ai::Content;
use tokio::sync::mpsc;

use crate::controller::LoopEvent;
use crate::interaction::Resolution;
use crate::permission::OperatingMode;

/// Feeds boundary operations into a running [`TurnController`](crate::TurnController).
///
/// Every method is fire-and-forget; the outcome shows up on the event
/// broadcast.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl ControllerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self { tx }
    }

    pub fn submit(&self, text: impl Into<String>) {
        self.send(LoopEvent::Submit(vec![Content::text(text)]));
    }

    pub fn submit_content(&self, content: Vec<Content>) {
        self.send(LoopEvent::Submit(content));
    }

    pub fn cancel(&self) {
        self.send(LoopEvent::Cancel);
    }

    pub fn resolve(&self, id: impl Into<String>, resolution: Resolution) {
        self.send(LoopEvent::Resolve {
            id: id.into(),
            resolution,
        });
    }

    pub fn compact(&self, focus: Option<String>) {
        self.send(LoopEvent::Compact { focus });
    }

    pub fn set_mode(&self, mode: OperatingMode) {
        self.send(LoopEvent::SetMode(mode));
    }

    /// Cancel anything in progress and stop the loop
    pub fn shutdown(&self) {
        self.send(LoopEvent::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: LoopEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("Controller loop has stopped; dropping event");
        }
    }
}
