//! Session-scoped bounty alerts
//!
//! The matcher listens to the change feed and, for every newly reported
//! bounty, alerts the hunters on duty in the same session. Alerts land in a
//! per-user inbox in the [`NotificationHub`], which pushes them to live
//! subscribers and dismisses them when their TTL runs out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::events::{BountyChange, ChangeFeed, ChangeKind};
use crate::expiration::Clock;
use crate::retry::read_with_backoff;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::store::BountyStore;
use crate::types::{Bounty, NotificationEvent};

pub const UNKNOWN_REPORTER: &str = "Unknown";

const LIVE_CAPACITY: usize = 32;

/// Users who should hear about `bounty`: everyone on duty in its session
/// except the reporter, each once.
pub fn match_recipients(bounty: &Bounty, active_members: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    active_members
        .iter()
        .copied()
        .filter(|user| *user != bounty.reporter_id && seen.insert(*user))
        .collect()
}

// ============================================================================
// HUB
// ============================================================================

/// What a live subscriber sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    Alert(NotificationEvent),
    Dismissed { bounty_id: Uuid, reason: DismissReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DismissReason {
    Expired,
    Dismissed,
}

#[derive(Default)]
struct HubState {
    inboxes: HashMap<Uuid, HashMap<Uuid, NotificationEvent>>,
    /// Pairs delivered within their TTL, each holding its expiry timer.
    /// Forgotten when the timer fires, so this only spans live alerts.
    delivered: HashMap<(Uuid, Uuid), TimerHandle>,
    live: HashMap<Uuid, broadcast::Sender<HubMessage>>,
}

impl HubState {
    fn take_pending(&mut self, user_id: Uuid, bounty_id: Uuid) -> Option<NotificationEvent> {
        let inbox = self.inboxes.get_mut(&user_id)?;
        let removed = inbox.remove(&bounty_id);
        if inbox.is_empty() {
            self.inboxes.remove(&user_id);
        }
        removed
    }

    /// Push to `user_id`'s live stream, dropping it once nobody listens.
    fn publish(&mut self, user_id: Uuid, message: HubMessage) {
        let Some(live) = self.live.get(&user_id) else {
            return;
        };
        if live.send(message).is_err() && live.receiver_count() == 0 {
            self.live.remove(&user_id);
        }
    }
}

struct HubInner {
    scheduler: Scheduler,
    state: Mutex<HubState>,
}

#[derive(Clone)]
pub struct NotificationHub {
    inner: Arc<HubInner>,
}

impl NotificationHub {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(HubInner {
                scheduler,
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    /// Deliver `event` to `recipient` unless this pair was already delivered
    /// within its TTL. The alert is dismissed automatically after `event.ttl`.
    pub fn deliver(&self, recipient: Uuid, event: NotificationEvent) -> bool {
        let bounty_id = event.bounty_id;
        let mut state = self.inner.state.lock();
        if state.delivered.contains_key(&(bounty_id, recipient)) {
            debug!("Alert for {} already delivered to {}", bounty_id, recipient);
            return false;
        }

        let weak: Weak<HubInner> = Arc::downgrade(&self.inner);
        let timer = self.inner.scheduler.schedule_in(event.ttl, move || {
            if let Some(inner) = weak.upgrade() {
                inner.expire(recipient, bounty_id);
            }
        });
        state.delivered.insert((bounty_id, recipient), timer);

        state.publish(recipient, HubMessage::Alert(event.clone()));
        state
            .inboxes
            .entry(recipient)
            .or_default()
            .insert(bounty_id, event);
        true
    }

    /// Manual dismissal. The pair stays remembered until its TTL runs out,
    /// so the alert cannot be delivered again in the meantime.
    pub fn dismiss(&self, user_id: Uuid, bounty_id: Uuid) -> bool {
        let mut state = self.inner.state.lock();
        if state.take_pending(user_id, bounty_id).is_none() {
            return false;
        }
        debug!("Alert for {} to {} dismissed", bounty_id, user_id);
        state.publish(
            user_id,
            HubMessage::Dismissed {
                bounty_id,
                reason: DismissReason::Dismissed,
            },
        );
        true
    }

    /// Alerts still showing for `user_id`, oldest first.
    pub fn pending(&self, user_id: Uuid) -> Vec<NotificationEvent> {
        let state = self.inner.state.lock();
        let mut events: Vec<NotificationEvent> = state
            .inboxes
            .get(&user_id)
            .map(|inbox| inbox.values().cloned().collect())
            .unwrap_or_default();
        events.sort_by_key(|e| e.emitted_at);
        events
    }

    pub fn subscribe(&self, user_id: Uuid) -> broadcast::Receiver<HubMessage> {
        let mut state = self.inner.state.lock();
        state
            .live
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(LIVE_CAPACITY).0)
            .subscribe()
    }
}

impl HubInner {
    fn expire(&self, user_id: Uuid, bounty_id: Uuid) {
        let mut state = self.state.lock();
        state.delivered.remove(&(bounty_id, user_id));
        if state.take_pending(user_id, bounty_id).is_none() {
            return;
        }
        debug!("Alert for {} to {} expired", bounty_id, user_id);
        state.publish(
            user_id,
            HubMessage::Dismissed {
                bounty_id,
                reason: DismissReason::Expired,
            },
        );
    }
}

// ============================================================================
// MATCHER
// ============================================================================

pub struct NotificationMatcher {
    store: Arc<dyn BountyStore>,
    hub: NotificationHub,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl NotificationMatcher {
    pub fn new(
        store: Arc<dyn BountyStore>,
        hub: NotificationHub,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            hub,
            clock,
            ttl,
        }
    }

    /// Match one change. Returns how many users were alerted.
    pub async fn handle(&self, change: &BountyChange) -> Result<usize> {
        if change.kind != ChangeKind::Insert {
            return Ok(0);
        }
        let bounty = &change.bounty;

        let store = &self.store;
        let session_id = &bounty.session_id;
        let members = read_with_backoff("session members", move || {
            store.active_members(session_id)
        })
        .await?;

        let recipients = match_recipients(bounty, &members);
        if recipients.is_empty() {
            debug!("No one on duty in {} for bounty {}", bounty.session_id, bounty.id);
            return Ok(0);
        }

        let reporter_name = self.reporter_name(bounty.reporter_id).await;
        let event = NotificationEvent {
            bounty_id: bounty.id,
            target_name: bounty.target_name.clone(),
            location: bounty.last_location.clone(),
            reporter_name,
            session_id: bounty.session_id.clone(),
            emitted_at: self.clock.now(),
            ttl: self.ttl,
        };

        let delivered = recipients
            .into_iter()
            .filter(|user| self.hub.deliver(*user, event.clone()))
            .count();
        info!(
            "Alerted {} hunters in {} about '{}'",
            delivered, bounty.session_id, bounty.target_name
        );
        Ok(delivered)
    }

    async fn reporter_name(&self, reporter_id: Uuid) -> String {
        match self.store.get_user(reporter_id).await {
            Ok(Some(user)) => user.username,
            Ok(None) => UNKNOWN_REPORTER.to_string(),
            Err(e) => {
                warn!("Could not resolve reporter {}: {}", reporter_id, e);
                UNKNOWN_REPORTER.to_string()
            }
        }
    }

    /// Consume the feed until it closes.
    pub async fn run(self, mut changes: broadcast::Receiver<BountyChange>) {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    if let Err(e) = self.handle(&change).await {
                        warn!("Failed to match alerts for {}: {}", change.bounty.id, e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Notification matcher lagged, skipped {} changes", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Notification matcher stopped");
    }

    pub fn spawn(self, feed: &ChangeFeed) -> JoinHandle<()> {
        let changes = feed.subscribe();
        tokio::spawn(self.run(changes))
    }
}
