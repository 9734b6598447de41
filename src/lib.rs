//! Bounty Board - session-scoped bounty hunting with a reputation ledger
//!
//! Players report hostile targets as bounties scoped to a game session.
//! Hunters claim kills with a proof screenshot, and the reporter arbitrates
//! each claim. Approved claims credit both sides through the trust ledger.
//!
//! # How it works
//!
//! 1. A reporter posts a bounty; it starts `active`
//! 2. Hunters on duty in the same session are alerted for a few seconds
//! 3. A hunter submits a confirmation, moving the bounty to `claimed`
//! 4. The reporter approves (`confirmed`, hunter +10, reporter +5) or
//!    rejects (back to `active` once no claim is pending)
//! 5. Bounties nobody confirms expire after their active period
//!
//! # Consistency
//!
//! - Every status change is a conditional write in the store
//! - Only one confirmation per bounty can ever be verified
//! - Reputation changes are atomic increments, journaled per approval

pub mod auth;
pub mod blob;
pub mod board;
pub mod config;
pub mod error;
pub mod events;
pub mod expiration;
pub mod ledger;
pub mod lifecycle;
pub mod notifications;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod store;
pub mod types;

pub use blob::{BlobStore, FsBlobStore, ProofKind, ProofUpload};
pub use board::{Approval, BountyBoard, BountyView};
pub use config::Config;
pub use error::{BountyError, Result};
pub use events::{BountyChange, ChangeFeed, ChangeKind};
pub use expiration::{Clock, ManualClock, Remaining, SystemClock};
pub use ledger::{Settlement, TrustLedger, HUNTER_AWARD, REPORTER_AWARD};
pub use notifications::{match_recipients, NotificationHub, NotificationMatcher};
pub use scheduler::{Scheduler, TimerHandle};
pub use session::{SessionCache, SessionId, SessionRegistry};
pub use store::{BountyStore, PgStore, SqliteStore};
pub use types::{
    ActivePeriod, Award, AwardRole, Bounty, BountyFilter, BountyStatus, Confirmation, NewBounty,
    NotificationEvent, SessionMembership, User,
};
