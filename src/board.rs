//! Bounty board: reporting, claiming and arbitration
//!
//! Ties the lifecycle guards, the store's conditional writes, the trust
//! ledger and the change feed together. Guards run on the snapshots the
//! caller passes in; the store then re-checks the same conditions atomically,
//! so a stale snapshot can never push a bounty off a legal edge.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::blob::{proof_key, BlobStore, ProofKind, ProofUpload, MAX_PROOF_BYTES};
use crate::config::Config;
use crate::error::{BountyError, Result};
use crate::events::{ChangeFeed, ChangeKind};
use crate::expiration::{self, Clock, Remaining};
use crate::ledger::{Settlement, TrustLedger};
use crate::lifecycle;
use crate::retry::read_with_backoff;
use crate::session::SessionId;
use crate::store::BountyStore;
use crate::types::{
    Bounty, BountyFilter, BountyStatus, Confirmation, NewBounty, User,
};

const MIN_TEXT_LEN: usize = 3;
const MAX_TIME_LEFT_MINUTES: i32 = 300;

/// Bounty plus what a viewer needs to render it.
#[derive(Debug, Clone, Serialize)]
pub struct BountyView {
    pub bounty: Bounty,
    pub remaining: Remaining,
    pub confirmations: Vec<Confirmation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Approval {
    pub bounty: Bounty,
    pub confirmation: Confirmation,
    pub settlement: Settlement,
}

pub struct BountyBoard {
    store: Arc<dyn BountyStore>,
    blobs: Arc<dyn BlobStore>,
    ledger: TrustLedger,
    feed: ChangeFeed,
    clock: Arc<dyn Clock>,
    max_proof_bytes: usize,
}

impl BountyBoard {
    pub fn new(
        store: Arc<dyn BountyStore>,
        blobs: Arc<dyn BlobStore>,
        feed: ChangeFeed,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger: TrustLedger::new(store.clone(), clock.clone()),
            store,
            blobs,
            feed,
            clock,
            max_proof_bytes: MAX_PROOF_BYTES,
        }
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        self.ledger = TrustLedger::new(self.store.clone(), self.clock.clone())
            .with_rewards(&config.rewards);
        self.max_proof_bytes = config.proofs.max_bytes;
        self
    }

    pub fn ledger(&self) -> &TrustLedger {
        &self.ledger
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    // ========================================================================
    // USERS
    // ========================================================================

    /// Mirror an identity-provider account. Reputation is never overwritten.
    pub async fn register_user(&self, user: &User) -> Result<User> {
        if user.username.trim().is_empty() {
            return Err(BountyError::InvalidFormat("username is empty".to_string()));
        }
        self.store.upsert_user(user).await?;
        self.load_user(user.id).await
    }

    pub async fn load_user(&self, id: Uuid) -> Result<User> {
        let store = &self.store;
        read_with_backoff("user", move || store.get_user(id))
            .await?
            .ok_or_else(|| BountyError::not_found("user", id))
    }

    // ========================================================================
    // BOUNTIES
    // ========================================================================

    pub async fn create_bounty(
        &self,
        reporter_id: Uuid,
        new: NewBounty,
        proof: Option<ProofUpload>,
    ) -> Result<Bounty> {
        let session_id = SessionId::parse(&new.session_id)?;
        let target_name = required_text("target_name", &new.target_name)?;
        let last_location = required_text("last_location", &new.last_location)?;
        if let Some(minutes) = new.time_left_when_killed {
            if !(0..=MAX_TIME_LEFT_MINUTES).contains(&minutes) {
                return Err(BountyError::InvalidFormat(format!(
                    "time_left_when_killed must be within 0..={} minutes",
                    MAX_TIME_LEFT_MINUTES
                )));
            }
        }
        if let Some(proof) = &proof {
            proof.validate(ProofKind::Sighting, self.max_proof_bytes)?;
        }
        self.load_user(reporter_id).await?;

        let proof_ref = match proof {
            Some(proof) => Some(self.upload_proof(reporter_id, &proof).await?),
            None => None,
        };

        let bounty = Bounty {
            id: Uuid::new_v4(),
            reporter_id,
            target_name,
            last_location,
            description: optional_text(new.description),
            proof_ref,
            reward_offer: optional_text(new.reward_offer),
            time_left_when_killed: new.time_left_when_killed,
            created_at: self.clock.now(),
            active_period: new.active_period,
            status: BountyStatus::Active,
            session_id,
        };

        self.store.insert_bounty(&bounty).await?;
        info!(
            "Bounty {} on '{}' reported by {} in session {}",
            bounty.id, bounty.target_name, reporter_id, bounty.session_id
        );

        self.feed.publish(ChangeKind::Insert, bounty.clone());
        Ok(bounty)
    }

    /// Read a bounty, expiring it first if its time is up.
    pub async fn get_bounty(&self, id: Uuid) -> Result<Bounty> {
        let store = &self.store;
        let bounty = read_with_backoff("bounty", move || store.get_bounty(id))
            .await?
            .ok_or_else(|| BountyError::not_found("bounty", id))?;

        let now = self.clock.now();
        if lifecycle::effective_status(&bounty, now) == bounty.status {
            return Ok(bounty);
        }

        match self.expire(&bounty, now).await {
            Ok(expired) => Ok(expired),
            Err(e) => {
                // Someone else moved it first; whatever they wrote wins.
                debug!("Lazy expiry of {} skipped: {}", id, e);
                let store = &self.store;
                let current = read_with_backoff("bounty", move || store.get_bounty(id))
                    .await?
                    .ok_or_else(|| BountyError::not_found("bounty", id))?;
                Ok(with_effective_status(current, now))
            }
        }
    }

    /// Newest first. Expiry is applied on read without a write; the sweep
    /// persists it.
    pub async fn list_bounties(&self, filter: BountyFilter) -> Result<Vec<Bounty>> {
        let store = &self.store;
        let status = filter.status();
        let bounties = read_with_backoff("bounties", move || store.list_bounties(status)).await?;

        let now = self.clock.now();
        Ok(bounties
            .into_iter()
            .map(|b| with_effective_status(b, now))
            .filter(|b| status.map_or(true, |s| b.status == s))
            .collect())
    }

    pub async fn view_bounty(&self, id: Uuid) -> Result<BountyView> {
        let bounty = self.get_bounty(id).await?;
        let confirmations = self.list_confirmations(id).await?;
        Ok(BountyView {
            remaining: expiration::remaining(&bounty, self.clock.now()),
            bounty,
            confirmations,
        })
    }

    pub async fn list_confirmations(&self, bounty_id: Uuid) -> Result<Vec<Confirmation>> {
        let store = &self.store;
        read_with_backoff("confirmations", move || store.list_confirmations(bounty_id)).await
    }

    pub async fn load_confirmation(&self, id: Uuid) -> Result<Confirmation> {
        let store = &self.store;
        read_with_backoff("confirmation", move || store.get_confirmation(id))
            .await?
            .ok_or_else(|| BountyError::not_found("confirmation", id))
    }

    // ========================================================================
    // CLAIMS
    // ========================================================================

    /// Claim a kill against `bounty`. The proof is uploaded before the insert;
    /// if the insert then fails the blob is left behind and the error is
    /// returned so the hunter can retry.
    pub async fn submit_confirmation(
        &self,
        bounty: &Bounty,
        hunter: &User,
        session_id: &str,
        proof: ProofUpload,
    ) -> Result<Confirmation> {
        let now = self.clock.now();
        lifecycle::check_submit(bounty, hunter.id, now)?;
        let session_id = SessionId::parse(session_id)?;
        proof.validate(ProofKind::Kill, self.max_proof_bytes)?;

        let proof_ref = self.upload_proof(hunter.id, &proof).await?;

        let confirmation = Confirmation {
            id: Uuid::new_v4(),
            bounty_id: bounty.id,
            hunter_id: hunter.id,
            proof_ref,
            session_id,
            confirmed_at: self.clock.now(),
            verified: false,
        };

        if !self.store.insert_claim(&confirmation).await? {
            warn!(
                "Claim by {} on bounty {} lost the race; bounty already closed (proof {} orphaned)",
                hunter.id, bounty.id, confirmation.proof_ref
            );
            return Err(BountyError::invalid_transition(format!(
                "bounty {} is no longer open for claims",
                bounty.id
            )));
        }

        info!(
            "Hunter {} claimed bounty {} (confirmation {})",
            hunter.id, bounty.id, confirmation.id
        );
        self.publish_update(bounty.id).await;
        Ok(confirmation)
    }

    pub async fn submit_confirmation_by_id(
        &self,
        bounty_id: Uuid,
        hunter_id: Uuid,
        session_id: &str,
        proof: ProofUpload,
    ) -> Result<Confirmation> {
        let bounty = self.get_bounty(bounty_id).await?;
        let hunter = self.load_user(hunter_id).await?;
        self.submit_confirmation(&bounty, &hunter, session_id, proof)
            .await
    }

    // ========================================================================
    // ARBITRATION
    // ========================================================================

    /// Approve one claim. Verification and `claimed -> confirmed` commit as
    /// one conditional write; awards follow through the ledger journal. A
    /// `PartialAward` error means the approval stands and `settle_awards`
    /// will apply whatever is missing.
    pub async fn approve(
        &self,
        bounty: &Bounty,
        confirmation: &Confirmation,
        reporter: &User,
    ) -> Result<Approval> {
        lifecycle::check_approve(bounty, confirmation, reporter.id)?;

        if !self.store.approve_claim(confirmation.id, bounty.id).await? {
            return Err(BountyError::invalid_transition(format!(
                "confirmation {} can no longer be approved",
                confirmation.id
            )));
        }
        info!(
            "Reporter {} approved confirmation {} on bounty {}",
            reporter.id, confirmation.id, bounty.id
        );

        let mut bounty = bounty.clone();
        bounty.status = BountyStatus::Confirmed;
        let mut confirmation = confirmation.clone();
        confirmation.verified = true;
        self.feed.publish(ChangeKind::Update, bounty.clone());

        let settlement = self.ledger.settle(&bounty, &confirmation).await?;
        Ok(Approval {
            bounty,
            confirmation,
            settlement,
        })
    }

    pub async fn approve_by_id(
        &self,
        bounty_id: Uuid,
        confirmation_id: Uuid,
        reporter_id: Uuid,
    ) -> Result<Approval> {
        let (bounty, confirmation, reporter) = self
            .load_arbitration(bounty_id, confirmation_id, reporter_id)
            .await?;
        self.approve(&bounty, &confirmation, &reporter).await
    }

    /// Discard one claim. Returns the bounty status afterwards: back to
    /// `active` only when no unverified claim remains.
    pub async fn reject(
        &self,
        bounty: &Bounty,
        confirmation: &Confirmation,
        reporter: &User,
    ) -> Result<BountyStatus> {
        lifecycle::check_reject(bounty, confirmation, reporter.id)?;

        let status = self
            .store
            .reject_claim(confirmation.id, bounty.id)
            .await?
            .ok_or_else(|| {
                BountyError::invalid_transition(format!(
                    "confirmation {} can no longer be rejected",
                    confirmation.id
                ))
            })?;

        info!(
            "Reporter {} rejected confirmation {} on bounty {} (now {})",
            reporter.id, confirmation.id, bounty.id, status
        );
        if status != bounty.status {
            self.publish_update(bounty.id).await;
        }
        Ok(status)
    }

    pub async fn reject_by_id(
        &self,
        bounty_id: Uuid,
        confirmation_id: Uuid,
        reporter_id: Uuid,
    ) -> Result<BountyStatus> {
        let (bounty, confirmation, reporter) = self
            .load_arbitration(bounty_id, confirmation_id, reporter_id)
            .await?;
        self.reject(&bounty, &confirmation, &reporter).await
    }

    // ========================================================================
    // EXPIRY & RECONCILIATION
    // ========================================================================

    pub async fn expire(&self, bounty: &Bounty, now: chrono::DateTime<chrono::Utc>) -> Result<Bounty> {
        lifecycle::check_expire(bounty, now)?;

        if !self
            .store
            .transition_status(bounty.id, BountyStatus::Active, BountyStatus::Expired)
            .await?
        {
            return Err(BountyError::invalid_transition(format!(
                "bounty {} is no longer active",
                bounty.id
            )));
        }

        info!("Bounty {} expired", bounty.id);
        let mut expired = bounty.clone();
        expired.status = BountyStatus::Expired;
        self.feed.publish(ChangeKind::Update, expired.clone());
        Ok(expired)
    }

    /// Persist expiry for every active bounty past its deadline.
    pub async fn expire_due(&self) -> Result<usize> {
        let now = self.clock.now();
        let active = self.store.list_bounties(Some(BountyStatus::Active)).await?;

        let mut expired = 0;
        for bounty in active
            .iter()
            .filter(|b| expiration::is_expired(b, now))
        {
            match self.expire(bounty, now).await {
                Ok(_) => expired += 1,
                Err(e) => debug!("Skipped expiring {}: {}", bounty.id, e),
            }
        }
        if expired > 0 {
            info!("Expiry sweep closed {} bounties", expired);
        }
        Ok(expired)
    }

    /// Apply any missing approval awards for one confirmation.
    pub async fn settle_awards(&self, confirmation_id: Uuid) -> Result<Settlement> {
        let confirmation = self.load_confirmation(confirmation_id).await?;
        let store = &self.store;
        let bounty_id = confirmation.bounty_id;
        let bounty = read_with_backoff("bounty", move || store.get_bounty(bounty_id))
            .await?
            .ok_or_else(|| BountyError::not_found("bounty", bounty_id))?;
        self.ledger.settle(&bounty, &confirmation).await
    }

    /// Settle every approved confirmation with outstanding awards. Returns
    /// how many were fully settled.
    pub async fn reconcile(&self) -> Result<usize> {
        let pending = self.ledger.unsettled().await?;
        let mut settled = 0;
        for confirmation_id in pending {
            match self.settle_awards(confirmation_id).await {
                Ok(s) => {
                    settled += 1;
                    info!("Reconciled awards {:?} for {}", s.applied, confirmation_id);
                }
                Err(e) => error!("Reconciliation of {} failed: {}", confirmation_id, e),
            }
        }
        Ok(settled)
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn upload_proof(&self, user_id: Uuid, proof: &ProofUpload) -> Result<String> {
        let key = proof_key(user_id, self.clock.now(), &proof.extension());
        let reference = self.blobs.put(&key, &proof.bytes).await?;
        debug!("Uploaded proof {} for {}", key, user_id);
        Ok(reference)
    }

    async fn load_arbitration(
        &self,
        bounty_id: Uuid,
        confirmation_id: Uuid,
        reporter_id: Uuid,
    ) -> Result<(Bounty, Confirmation, User)> {
        let bounty = self.get_bounty(bounty_id).await?;
        let confirmation = self.load_confirmation(confirmation_id).await?;
        let reporter = self.load_user(reporter_id).await?;
        Ok((bounty, confirmation, reporter))
    }

    async fn publish_update(&self, bounty_id: Uuid) {
        match self.store.get_bounty(bounty_id).await {
            Ok(Some(bounty)) => self.feed.publish(ChangeKind::Update, bounty),
            Ok(None) => {}
            Err(e) => warn!("Could not publish update for {}: {}", bounty_id, e),
        }
    }
}

fn with_effective_status(mut bounty: Bounty, now: chrono::DateTime<chrono::Utc>) -> Bounty {
    bounty.status = lifecycle::effective_status(&bounty, now);
    bounty
}

fn required_text(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.chars().count() < MIN_TEXT_LEN {
        return Err(BountyError::InvalidFormat(format!(
            "{} must be at least {} characters",
            field, MIN_TEXT_LEN
        )));
    }
    Ok(value.to_string())
}

fn optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
