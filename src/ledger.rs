//! Trust ledger
//!
//! Reputation only moves through here. Plain awards are a single atomic
//! increment in the store. Approval credits go through the award journal so
//! each (confirmation, role) pair is credited at most once, which makes
//! [`TrustLedger::settle`] safe to re-run after a partial failure.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RewardsConfig;
use crate::error::{BountyError, Result};
use crate::expiration::Clock;
use crate::store::BountyStore;
use crate::types::{Award, AwardRole, Bounty, Confirmation};

pub const HUNTER_AWARD: i64 = 10;
pub const REPORTER_AWARD: i64 = 5;

/// Outcome of settling one approved confirmation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Settlement {
    pub confirmation_id: Uuid,
    /// Credited by this call.
    pub applied: Vec<AwardRole>,
    /// Already credited by an earlier call.
    pub already_settled: Vec<AwardRole>,
}

pub struct TrustLedger {
    store: Arc<dyn BountyStore>,
    clock: Arc<dyn Clock>,
    hunter_award: i64,
    reporter_award: i64,
}

impl TrustLedger {
    pub fn new(store: Arc<dyn BountyStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            hunter_award: HUNTER_AWARD,
            reporter_award: REPORTER_AWARD,
        }
    }

    pub fn with_rewards(mut self, rewards: &RewardsConfig) -> Self {
        self.hunter_award = rewards.hunter_award;
        self.reporter_award = rewards.reporter_award;
        self
    }

    /// Atomic `reputation += delta`. Returns the new reputation.
    pub async fn award(&self, user_id: Uuid, delta: i64) -> Result<i64> {
        let reputation = self.store.increment_reputation(user_id, delta).await?;
        info!("Awarded {:+} to {} (now {})", delta, user_id, reputation);
        Ok(reputation)
    }

    pub fn amount_for(&self, role: AwardRole) -> i64 {
        match role {
            AwardRole::Hunter => self.hunter_award,
            AwardRole::Reporter => self.reporter_award,
        }
    }

    /// Apply whichever approval awards are still missing for a verified
    /// confirmation. Fails with `PartialAward` if any award could not land.
    pub async fn settle(&self, bounty: &Bounty, confirmation: &Confirmation) -> Result<Settlement> {
        if !confirmation.verified {
            return Err(BountyError::invalid_transition(format!(
                "confirmation {} is not approved",
                confirmation.id
            )));
        }

        let mut settlement = Settlement {
            confirmation_id: confirmation.id,
            ..Default::default()
        };
        let mut missing = Vec::new();

        for role in AwardRole::BOTH {
            let user_id = match role {
                AwardRole::Hunter => confirmation.hunter_id,
                AwardRole::Reporter => bounty.reporter_id,
            };
            let award = Award {
                confirmation_id: confirmation.id,
                role,
                user_id,
                delta: self.amount_for(role),
                awarded_at: self.clock.now(),
            };

            match self.store.apply_award(&award).await {
                Ok(true) => {
                    info!(
                        "Credited {} {:+} as {} for confirmation {}",
                        user_id,
                        award.delta,
                        role.as_str(),
                        confirmation.id
                    );
                    settlement.applied.push(role);
                }
                Ok(false) => settlement.already_settled.push(role),
                Err(e) => {
                    error!(
                        "Award {} for confirmation {} failed: {}",
                        role.as_str(),
                        confirmation.id,
                        e
                    );
                    missing.push(role);
                }
            }
        }

        if missing.is_empty() {
            Ok(settlement)
        } else {
            warn!(
                "Confirmation {} left with pending awards {:?}; settle again to reconcile",
                confirmation.id, missing
            );
            Err(BountyError::PartialAward {
                confirmation_id: confirmation.id,
                missing,
            })
        }
    }

    /// Verified confirmations whose awards are incomplete.
    pub async fn unsettled(&self) -> Result<Vec<Uuid>> {
        self.store.unsettled_confirmations().await
    }
}
