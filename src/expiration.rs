//! Expiration policy
//!
//! Expiry is always derived from `created_at + active_period`. No expiry
//! instant is persisted, so clock skew between writers cannot drift it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::types::Bounty;

pub const EXPIRED_LABEL: &str = "EXPIRED";
pub const NO_EXPIRY_LABEL: &str = "NO EXPIRY";

/// Source of "now" for every time-dependent decision.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for simulations and tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Remaining {
    pub label: String,
    pub is_expired: bool,
}

/// Instant the bounty stops accepting claims, `None` for unlimited bounties.
pub fn expires_at(bounty: &Bounty) -> Option<DateTime<Utc>> {
    let period = bounty.active_period.duration()?;
    let period = Duration::from_std(period).ok()?;
    Some(bounty.created_at + period)
}

pub fn is_expired(bounty: &Bounty, now: DateTime<Utc>) -> bool {
    expires_at(bounty).is_some_and(|expiry| now >= expiry)
}

pub fn remaining(bounty: &Bounty, now: DateTime<Utc>) -> Remaining {
    let Some(expiry) = expires_at(bounty) else {
        return Remaining {
            label: NO_EXPIRY_LABEL.to_string(),
            is_expired: false,
        };
    };

    if now >= expiry {
        return Remaining {
            label: EXPIRED_LABEL.to_string(),
            is_expired: true,
        };
    }

    Remaining {
        label: format_remaining(expiry - now),
        is_expired: false,
    }
}

/// Floor-truncated "2d 3h", "5h 12m" or "42m".
fn format_remaining(left: Duration) -> String {
    let days = left.num_days();
    let hours = left.num_hours() % 24;
    let minutes = left.num_minutes() % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}
