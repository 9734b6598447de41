//! Bounty change feed
//!
//! Row-level change notifications, published after each committed write.
//! Subscribers filter by kind and by session themselves; a lagging subscriber
//! loses the oldest events rather than blocking writers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::Bounty;

const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, Serialize)]
pub struct BountyChange {
    pub kind: ChangeKind,
    pub bounty: Bounty,
}

#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<BountyChange>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::with_capacity(FEED_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BountyChange> {
        self.sender.subscribe()
    }

    pub fn publish(&self, kind: ChangeKind, bounty: Bounty) {
        let id = bounty.id;
        // No subscribers is not an error: nobody is listening yet.
        match self.sender.send(BountyChange { kind, bounty }) {
            Ok(receivers) => debug!("Published {:?} for bounty {} to {} subscribers", kind, id, receivers),
            Err(_) => debug!("Published {:?} for bounty {} with no subscribers", kind, id),
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}
