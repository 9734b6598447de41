//! Authoritative data store
//!
//! Every mutation that participates in a race is expressed as a single
//! conditional statement or a single transaction inside the store, never as
//! an application-level read-modify-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::session::SessionId;
use crate::types::{Award, Bounty, BountyStatus, Confirmation, SessionMembership, User};

mod postgres;
mod sqlite;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait BountyStore: Send + Sync {
    // ------------------------------------------------------------------
    // Users (mirrored from the identity provider)
    // ------------------------------------------------------------------

    /// Insert or refresh username/role. Never touches `reputation`.
    async fn upsert_user(&self, user: &User) -> Result<()>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;

    // ------------------------------------------------------------------
    // Bounties
    // ------------------------------------------------------------------

    async fn insert_bounty(&self, bounty: &Bounty) -> Result<()>;

    async fn get_bounty(&self, id: Uuid) -> Result<Option<Bounty>>;

    /// Newest first, optionally restricted to one persisted status.
    async fn list_bounties(&self, status: Option<BountyStatus>) -> Result<Vec<Bounty>>;

    /// Compare-and-swap on the status column. `false` when the row was not
    /// in `from`.
    async fn transition_status(&self, id: Uuid, from: BountyStatus, to: BountyStatus)
        -> Result<bool>;

    // ------------------------------------------------------------------
    // Confirmations
    // ------------------------------------------------------------------

    /// Insert an unverified confirmation and mark the bounty claimed, as long
    /// as the bounty is still open (`active`, or `claimed` by a sibling).
    /// `false` when the bounty had already moved on.
    async fn insert_claim(&self, confirmation: &Confirmation) -> Result<bool>;

    async fn get_confirmation(&self, id: Uuid) -> Result<Option<Confirmation>>;

    /// Newest first.
    async fn list_confirmations(&self, bounty_id: Uuid) -> Result<Vec<Confirmation>>;

    /// Flip `verified` (guarded on `verified = false`) and move the bounty
    /// `claimed -> confirmed` in one transaction. `false` if either guard
    /// failed, in which case nothing changed.
    async fn approve_claim(&self, confirmation_id: Uuid, bounty_id: Uuid) -> Result<bool>;

    /// Delete an unverified confirmation; when no unverified sibling remains,
    /// revert `claimed -> active`. Returns the bounty status after the
    /// operation, `None` if the confirmation was not deletable.
    async fn reject_claim(&self, confirmation_id: Uuid, bounty_id: Uuid)
        -> Result<Option<BountyStatus>>;

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    /// `reputation = reputation + delta`. Returns the new value.
    async fn increment_reputation(&self, user_id: Uuid, delta: i64) -> Result<i64>;

    /// Journal the award and increment the recipient in one transaction.
    /// `false` when this (confirmation, role) was already credited.
    async fn apply_award(&self, award: &Award) -> Result<bool>;

    async fn list_awards(&self, confirmation_id: Uuid) -> Result<Vec<Award>>;

    /// Verified confirmations with fewer than two journaled awards.
    async fn unsettled_confirmations(&self) -> Result<Vec<Uuid>>;

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Upsert `(user, session)` as active and deactivate every other
    /// membership of the user in the same transaction.
    async fn activate_session(
        &self,
        user_id: Uuid,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn deactivate_session(
        &self,
        user_id: Uuid,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn active_session(&self, user_id: Uuid) -> Result<Option<SessionMembership>>;

    /// Users currently on duty in `session_id`.
    async fn active_members(&self, session_id: &SessionId) -> Result<Vec<Uuid>>;
}
