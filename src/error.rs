//! Error taxonomy for the bounty engine
//!
//! Client-input errors (`InvalidFormat`, `InvalidTransition`) are surfaced
//! immediately and never retried. `UpstreamFailure` covers the data store and
//! blob store being unavailable. `PartialAward` means arbitration committed but
//! at least one ledger credit is still outstanding.

use thiserror::Error;
use uuid::Uuid;

use crate::types::AwardRole;

pub type Result<T, E = BountyError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum BountyError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    /// The confirmation is verified but these awards did not land.
    #[error("confirmation {confirmation_id} approved but awards pending for {missing:?}")]
    PartialAward {
        confirmation_id: Uuid,
        missing: Vec<AwardRole>,
    },
}

impl BountyError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    /// Only upstream failures are worth retrying; everything else is a
    /// deterministic answer about the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamFailure(_))
    }

    /// Stable machine-readable tag used in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidFormat(_) => "invalid_format",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::NotFound { .. } => "not_found",
            Self::UpstreamFailure(_) => "upstream_failure",
            Self::PartialAward { .. } => "partial_award",
        }
    }
}

impl From<rusqlite::Error> for BountyError {
    fn from(err: rusqlite::Error) -> Self {
        Self::UpstreamFailure(format!("sqlite: {}", err))
    }
}

impl From<tokio_postgres::Error> for BountyError {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::UpstreamFailure(format!("postgres: {}", err))
    }
}

impl From<deadpool_postgres::PoolError> for BountyError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::UpstreamFailure(format!("postgres pool: {}", err))
    }
}

impl From<std::io::Error> for BountyError {
    fn from(err: std::io::Error) -> Self {
        Self::UpstreamFailure(format!("io: {}", err))
    }
}
