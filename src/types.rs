//! Core data model shared by the store, the engine and the HTTP layer

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BountyError;
use crate::session::SessionId;

// ============================================================================
// ENUMS
// ============================================================================

/// Canonical bounty status. Presentation consumes only this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "lowercase")]
#[postgres(name = "bounty_status")]
pub enum BountyStatus {
    #[postgres(name = "active")]
    Active,
    #[postgres(name = "claimed")]
    Claimed,
    #[postgres(name = "confirmed")]
    Confirmed,
    #[postgres(name = "expired")]
    Expired,
}

impl BountyStatus {
    pub const ALL: [BountyStatus; 4] = [
        BountyStatus::Active,
        BountyStatus::Claimed,
        BountyStatus::Confirmed,
        BountyStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Claimed => "claimed",
            Self::Confirmed => "confirmed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for BountyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BountyStatus {
    type Err = BountyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "claimed" => Ok(Self::Claimed),
            "confirmed" => Ok(Self::Confirmed),
            "expired" => Ok(Self::Expired),
            other => Err(BountyError::InvalidFormat(format!(
                "unknown bounty status '{}'",
                other
            ))),
        }
    }
}

/// Configured lifetime class of a bounty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSql, FromSql)]
#[postgres(name = "active_period")]
pub enum ActivePeriod {
    #[serde(rename = "24h")]
    #[postgres(name = "24h")]
    Day,
    #[default]
    #[serde(rename = "1week")]
    #[postgres(name = "1week")]
    Week,
    #[serde(rename = "unlimited")]
    #[postgres(name = "unlimited")]
    Unlimited,
}

impl ActivePeriod {
    /// Lifetime of the bounty, `None` when it never expires.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Day => Some(Duration::from_secs(24 * 60 * 60)),
            Self::Week => Some(Duration::from_secs(7 * 24 * 60 * 60)),
            Self::Unlimited => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "24h",
            Self::Week => "1week",
            Self::Unlimited => "unlimited",
        }
    }
}

impl FromStr for ActivePeriod {
    type Err = BountyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "24h" => Ok(Self::Day),
            "1week" => Ok(Self::Week),
            "unlimited" => Ok(Self::Unlimited),
            other => Err(BountyError::InvalidFormat(format!(
                "unknown active period '{}'",
                other
            ))),
        }
    }
}

/// Which side of an approval a ledger credit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AwardRole {
    Hunter,
    Reporter,
}

impl AwardRole {
    pub const BOTH: [AwardRole; 2] = [AwardRole::Hunter, AwardRole::Reporter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hunter => "hunter",
            Self::Reporter => "reporter",
        }
    }
}

impl FromStr for AwardRole {
    type Err = BountyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hunter" => Ok(Self::Hunter),
            "reporter" => Ok(Self::Reporter),
            other => Err(BountyError::InvalidFormat(format!(
                "unknown award role '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// ENTITIES
// ============================================================================

/// Mirror of an identity-provider account. Only the ledger touches `reputation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub reputation: i64,
    pub role: String,
}

impl User {
    pub fn new(id: Uuid, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            reputation: 0,
            role: "hunter".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounty {
    pub id: Uuid,
    pub reporter_id: Uuid,
    pub target_name: String,
    pub last_location: String,
    pub description: Option<String>,
    pub proof_ref: Option<String>,
    pub reward_offer: Option<String>,
    pub time_left_when_killed: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub active_period: ActivePeriod,
    pub status: BountyStatus,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub id: Uuid,
    pub bounty_id: Uuid,
    pub hunter_id: Uuid,
    pub proof_ref: String,
    pub session_id: SessionId,
    pub confirmed_at: DateTime<Utc>,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMembership {
    pub user_id: Uuid,
    pub session_id: SessionId,
    pub is_active: bool,
    pub last_updated: DateTime<Utc>,
}

/// Ledger journal row: one per (confirmation, role).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Award {
    pub confirmation_id: Uuid,
    pub role: AwardRole,
    pub user_id: Uuid,
    pub delta: i64,
    pub awarded_at: DateTime<Utc>,
}

/// Transient alert for an on-duty hunter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub bounty_id: Uuid,
    pub target_name: String,
    pub location: String,
    pub reporter_name: String,
    pub session_id: SessionId,
    pub emitted_at: DateTime<Utc>,
    #[serde(with = "ttl_secs")]
    pub ttl: Duration,
}

mod ttl_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(ttl.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

// ============================================================================
// INPUTS
// ============================================================================

/// Reporter-supplied fields for a new bounty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewBounty {
    pub session_id: String,
    pub target_name: String,
    pub last_location: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reward_offer: Option<String>,
    #[serde(default)]
    pub time_left_when_killed: Option<i32>,
    #[serde(default)]
    pub active_period: ActivePeriod,
}

/// Listing filter, mirrors the feed tabs of the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BountyFilter {
    #[default]
    All,
    Active,
    Claimed,
}

impl BountyFilter {
    pub fn status(&self) -> Option<BountyStatus> {
        match self {
            Self::All => None,
            Self::Active => Some(BountyStatus::Active),
            Self::Claimed => Some(BountyStatus::Claimed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in BountyStatus::ALL {
            assert_eq!(status.as_str().parse::<BountyStatus>().unwrap(), status);
        }
        assert!("pending".parse::<BountyStatus>().is_err());
    }

    #[test]
    fn test_active_period_wire_names() {
        let json = serde_json::to_string(&ActivePeriod::Day).unwrap();
        assert_eq!(json, "\"24h\"");
        let period: ActivePeriod = serde_json::from_str("\"1week\"").unwrap();
        assert_eq!(period, ActivePeriod::Week);
        assert_eq!(ActivePeriod::default(), ActivePeriod::Week);
        assert!(ActivePeriod::Unlimited.duration().is_none());
    }

    #[test]
    fn test_notification_ttl_serializes_as_seconds() {
        let event = NotificationEvent {
            bounty_id: Uuid::nil(),
            target_name: "Raider".to_string(),
            location: "North Base".to_string(),
            reporter_name: "alice".to_string(),
            session_id: "ABCDE-1234".parse().unwrap(),
            emitted_at: Utc::now(),
            ttl: Duration::from_secs(10),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["ttl"], 10);
        assert_eq!(value["session_id"], "ABCDE-1234");
    }
}
