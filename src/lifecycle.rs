//! Bounty lifecycle state machine
//!
//! ```text
//! active ──submit──▶ claimed ──approve──▶ confirmed
//!   │  ◀──reject (none pending)──┘
//!   └──expire──▶ expired
//! ```
//!
//! The guards here are pure: they decide legality from snapshots. The store
//! re-checks the same conditions atomically when the transition is written.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{BountyError, Result};
use crate::expiration;
use crate::types::{Bounty, BountyStatus, Confirmation};

impl BountyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Expired)
    }

    pub fn can_transition_to(&self, next: BountyStatus) -> bool {
        use BountyStatus::*;
        matches!(
            (self, next),
            (Active, Claimed) | (Claimed, Confirmed) | (Claimed, Active) | (Active, Expired)
        )
    }
}

/// Status as readers must see it: an `active` bounty past its expiry reads
/// as `expired` whether or not that has been persisted yet.
pub fn effective_status(bounty: &Bounty, now: DateTime<Utc>) -> BountyStatus {
    if bounty.status == BountyStatus::Active && expiration::is_expired(bounty, now) {
        BountyStatus::Expired
    } else {
        bounty.status
    }
}

pub fn check_submit(bounty: &Bounty, hunter_id: Uuid, now: DateTime<Utc>) -> Result<()> {
    if hunter_id == bounty.reporter_id {
        return Err(BountyError::invalid_transition(
            "reporters cannot claim their own bounty",
        ));
    }
    match effective_status(bounty, now) {
        BountyStatus::Active => Ok(()),
        BountyStatus::Expired => Err(BountyError::invalid_transition(format!(
            "bounty {} has expired",
            bounty.id
        ))),
        status => Err(BountyError::invalid_transition(format!(
            "bounty {} is {}, claims need an active bounty",
            bounty.id, status
        ))),
    }
}

pub fn check_approve(bounty: &Bounty, confirmation: &Confirmation, reporter_id: Uuid) -> Result<()> {
    check_arbiter(bounty, confirmation, reporter_id)?;
    if bounty.status != BountyStatus::Claimed {
        return Err(BountyError::invalid_transition(format!(
            "bounty {} is {}, only claimed bounties can be approved",
            bounty.id, bounty.status
        )));
    }
    Ok(())
}

pub fn check_reject(bounty: &Bounty, confirmation: &Confirmation, reporter_id: Uuid) -> Result<()> {
    check_arbiter(bounty, confirmation, reporter_id)
}

pub fn check_expire(bounty: &Bounty, now: DateTime<Utc>) -> Result<()> {
    if bounty.status != BountyStatus::Active {
        return Err(BountyError::invalid_transition(format!(
            "bounty {} is {}, only active bounties expire",
            bounty.id, bounty.status
        )));
    }
    if !expiration::is_expired(bounty, now) {
        return Err(BountyError::invalid_transition(format!(
            "bounty {} has not reached its expiry",
            bounty.id
        )));
    }
    Ok(())
}

/// Shared approve/reject preconditions.
fn check_arbiter(bounty: &Bounty, confirmation: &Confirmation, reporter_id: Uuid) -> Result<()> {
    if confirmation.bounty_id != bounty.id {
        return Err(BountyError::not_found(
            "confirmation",
            format!("{} on bounty {}", confirmation.id, bounty.id),
        ));
    }
    if reporter_id != bounty.reporter_id {
        return Err(BountyError::invalid_transition(
            "only the reporter can arbitrate confirmations",
        ));
    }
    if confirmation.verified {
        return Err(BountyError::invalid_transition(format!(
            "confirmation {} is already approved",
            confirmation.id
        )));
    }
    Ok(())
}
