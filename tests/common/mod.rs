//! Shared integration-test store: the embedded store with switches for
//! failing awards and for pausing a session activation mid-write.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use bounty_board::store::BountyStore;
use bounty_board::{
    Award, AwardRole, Bounty, BountyError, BountyStatus, Confirmation, Result, SessionId,
    SessionMembership, SqliteStore, User,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

/// Holds the next `activate_session` after it is entered, until released.
#[derive(Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

pub struct HookedStore {
    pub inner: Arc<SqliteStore>,
    pub fail_reporter_awards: Mutex<bool>,
    pub activation_gate: Mutex<Option<Gate>>,
}

impl HookedStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            fail_reporter_awards: Mutex::new(false),
            activation_gate: Mutex::new(None),
        }
    }

    pub fn gate_next_activation(&self) -> Gate {
        let gate = Gate::default();
        *self.activation_gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl BountyStore for HookedStore {
    async fn upsert_user(&self, user: &User) -> Result<()> {
        self.inner.upsert_user(user).await
    }
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.inner.get_user(id).await
    }
    async fn insert_bounty(&self, bounty: &Bounty) -> Result<()> {
        self.inner.insert_bounty(bounty).await
    }
    async fn get_bounty(&self, id: Uuid) -> Result<Option<Bounty>> {
        self.inner.get_bounty(id).await
    }
    async fn list_bounties(&self, status: Option<BountyStatus>) -> Result<Vec<Bounty>> {
        self.inner.list_bounties(status).await
    }
    async fn transition_status(
        &self,
        id: Uuid,
        from: BountyStatus,
        to: BountyStatus,
    ) -> Result<bool> {
        self.inner.transition_status(id, from, to).await
    }
    async fn insert_claim(&self, confirmation: &Confirmation) -> Result<bool> {
        self.inner.insert_claim(confirmation).await
    }
    async fn get_confirmation(&self, id: Uuid) -> Result<Option<Confirmation>> {
        self.inner.get_confirmation(id).await
    }
    async fn list_confirmations(&self, bounty_id: Uuid) -> Result<Vec<Confirmation>> {
        self.inner.list_confirmations(bounty_id).await
    }
    async fn approve_claim(&self, confirmation_id: Uuid, bounty_id: Uuid) -> Result<bool> {
        self.inner.approve_claim(confirmation_id, bounty_id).await
    }
    async fn reject_claim(
        &self,
        confirmation_id: Uuid,
        bounty_id: Uuid,
    ) -> Result<Option<BountyStatus>> {
        self.inner.reject_claim(confirmation_id, bounty_id).await
    }
    async fn increment_reputation(&self, user_id: Uuid, delta: i64) -> Result<i64> {
        self.inner.increment_reputation(user_id, delta).await
    }
    async fn apply_award(&self, award: &Award) -> Result<bool> {
        if award.role == AwardRole::Reporter && *self.fail_reporter_awards.lock() {
            return Err(BountyError::UpstreamFailure("ledger offline".to_string()));
        }
        self.inner.apply_award(award).await
    }
    async fn list_awards(&self, confirmation_id: Uuid) -> Result<Vec<Award>> {
        self.inner.list_awards(confirmation_id).await
    }
    async fn unsettled_confirmations(&self) -> Result<Vec<Uuid>> {
        self.inner.unsettled_confirmations().await
    }
    async fn activate_session(
        &self,
        user_id: Uuid,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let gate = self.activation_gate.lock().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.inner.activate_session(user_id, session_id, at).await
    }
    async fn deactivate_session(
        &self,
        user_id: Uuid,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.deactivate_session(user_id, session_id, at).await
    }
    async fn active_session(&self, user_id: Uuid) -> Result<Option<SessionMembership>> {
        self.inner.active_session(user_id).await
    }
    async fn active_members(&self, session_id: &SessionId) -> Result<Vec<Uuid>> {
        self.inner.active_members(session_id).await
    }
}
