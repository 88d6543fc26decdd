use std::sync::mpsc;

use super::arena::NodeId;

/// Notifications a `DirTree` sends to its observers.
///
/// `DeletingChild` is always sent while the node still exists, and
/// `ChildDeleted` after it is gone, so observers can drop their handles first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    StartingReading,
    /// Sent by `clear()` before the children of the root are dropped
    Clearing,
    ChildAdded(NodeId),
    DeletingChild(NodeId),
    ChildDeleted,
    /// A directory and everything below it has been read
    ReadJobFinished(NodeId),
    /// A directory's own entries have been read; `None` means the initial stat failed
    FinalizeLocal(Option<NodeId>),
    Finished,
    Aborted,
    ProgressInfo(String),
}

/// Fan-out of events to any number of channel subscribers.
#[derive(Debug, Default)]
pub struct EventSink {
    subscribers: Vec<mpsc::Sender<TreeEvent>>,
}

impl EventSink {
    pub fn subscribe(&mut self) -> mpsc::Receiver<TreeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber; subscribers whose receiver
    /// was dropped are forgotten.
    pub fn emit(&mut self, event: TreeEvent) {
        tracing::trace!(?event, "tree event");
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
