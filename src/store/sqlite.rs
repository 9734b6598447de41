//! Embedded SQLite store
//!
//! Default backend when no `DATABASE_URL` is configured, and the backend every
//! test runs against. A single connection behind a mutex serialises writers,
//! so each transaction below is atomic with respect to every other call.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::BountyStore;
use crate::error::{BountyError, Result};
use crate::session::SessionId;
use crate::types::{Award, Bounty, BountyStatus, Confirmation, SessionMembership, User};

const SCHEMA_V1: &str = include_str!("../../migrations/sqlite/001_schema.sql");

const BOUNTY_COLUMNS: &str = "id, reporter_id, target_name, last_location, description, proof_ref, \
     reward_offer, time_left_when_killed, created_at, active_period, status, session_id";

const CONFIRMATION_COLUMNS: &str =
    "id, bounty_id, hunter_id, proof_ref, session_id, confirmed_at, verified";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let storage = Self::from_connection(conn)?;
        info!("Opened SQLite store at {}", path.as_ref().display());
        Ok(storage)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.run_migrations()?;
        Ok(storage)
    }

    fn run_migrations(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA_V1)?;
            debug!("Applied SQLite migration 001_schema");
            Ok(())
        })
    }

    /// Runs `f` with the connection locked. `f` never awaits, so the guard
    /// never crosses a suspension point.
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn col_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn col_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn col_parse<T: FromStr<Err = BountyError>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn bounty_from_row(row: &Row<'_>) -> rusqlite::Result<Bounty> {
    Ok(Bounty {
        id: col_uuid(row, 0)?,
        reporter_id: col_uuid(row, 1)?,
        target_name: row.get(2)?,
        last_location: row.get(3)?,
        description: row.get(4)?,
        proof_ref: row.get(5)?,
        reward_offer: row.get(6)?,
        time_left_when_killed: row.get(7)?,
        created_at: col_time(row, 8)?,
        active_period: col_parse(row, 9)?,
        status: col_parse(row, 10)?,
        session_id: col_parse(row, 11)?,
    })
}

fn confirmation_from_row(row: &Row<'_>) -> rusqlite::Result<Confirmation> {
    Ok(Confirmation {
        id: col_uuid(row, 0)?,
        bounty_id: col_uuid(row, 1)?,
        hunter_id: col_uuid(row, 2)?,
        proof_ref: row.get(3)?,
        session_id: col_parse(row, 4)?,
        confirmed_at: col_time(row, 5)?,
        verified: row.get(6)?,
    })
}

fn membership_from_row(row: &Row<'_>) -> rusqlite::Result<SessionMembership> {
    Ok(SessionMembership {
        user_id: col_uuid(row, 0)?,
        session_id: col_parse(row, 1)?,
        is_active: row.get(2)?,
        last_updated: col_time(row, 3)?,
    })
}

// ============================================================================
// STORE
// ============================================================================

#[async_trait]
impl BountyStore for SqliteStore {
    async fn upsert_user(&self, user: &User) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, reputation, role) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username, role = excluded.role",
                params![user.id.to_string(), user.username, user.reputation, user.role],
            )?;
            Ok(())
        })
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let user = conn
                .query_row(
                    "SELECT id, username, reputation, role FROM users WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok(User {
                            id: col_uuid(row, 0)?,
                            username: row.get(1)?,
                            reputation: row.get(2)?,
                            role: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(user)
        })
    }

    async fn insert_bounty(&self, bounty: &Bounty) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO bounties ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    BOUNTY_COLUMNS
                ),
                params![
                    bounty.id.to_string(),
                    bounty.reporter_id.to_string(),
                    bounty.target_name,
                    bounty.last_location,
                    bounty.description,
                    bounty.proof_ref,
                    bounty.reward_offer,
                    bounty.time_left_when_killed,
                    ts(&bounty.created_at),
                    bounty.active_period.as_str(),
                    bounty.status.as_str(),
                    bounty.session_id.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    async fn get_bounty(&self, id: Uuid) -> Result<Option<Bounty>> {
        self.with_conn(|conn| {
            let bounty = conn
                .query_row(
                    &format!("SELECT {} FROM bounties WHERE id = ?1", BOUNTY_COLUMNS),
                    params![id.to_string()],
                    bounty_from_row,
                )
                .optional()?;
            Ok(bounty)
        })
    }

    async fn list_bounties(&self, status: Option<BountyStatus>) -> Result<Vec<Bounty>> {
        self.with_conn(|conn| {
            let bounties = match status {
                Some(status) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM bounties WHERE status = ?1 ORDER BY created_at DESC",
                        BOUNTY_COLUMNS
                    ))?;
                    let rows = stmt.query_map(params![status.as_str()], bounty_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM bounties ORDER BY created_at DESC",
                        BOUNTY_COLUMNS
                    ))?;
                    let rows = stmt.query_map([], bounty_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(bounties)
        })
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: BountyStatus,
        to: BountyStatus,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE bounties SET status = ?3 WHERE id = ?1 AND status = ?2",
                params![id.to_string(), from.as_str(), to.as_str()],
            )?;
            Ok(updated > 0)
        })
    }

    async fn insert_claim(&self, confirmation: &Confirmation) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let claimed = tx.execute(
                "UPDATE bounties SET status = 'claimed'
                 WHERE id = ?1 AND status IN ('active', 'claimed')",
                params![confirmation.bounty_id.to_string()],
            )?;
            if claimed == 0 {
                return Ok(false);
            }

            tx.execute(
                &format!(
                    "INSERT INTO confirmations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                    CONFIRMATION_COLUMNS
                ),
                params![
                    confirmation.id.to_string(),
                    confirmation.bounty_id.to_string(),
                    confirmation.hunter_id.to_string(),
                    confirmation.proof_ref,
                    confirmation.session_id.as_str(),
                    ts(&confirmation.confirmed_at),
                ],
            )?;

            tx.commit()?;
            Ok(true)
        })
    }

    async fn get_confirmation(&self, id: Uuid) -> Result<Option<Confirmation>> {
        self.with_conn(|conn| {
            let confirmation = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM confirmations WHERE id = ?1",
                        CONFIRMATION_COLUMNS
                    ),
                    params![id.to_string()],
                    confirmation_from_row,
                )
                .optional()?;
            Ok(confirmation)
        })
    }

    async fn list_confirmations(&self, bounty_id: Uuid) -> Result<Vec<Confirmation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM confirmations WHERE bounty_id = ?1 ORDER BY confirmed_at DESC",
                CONFIRMATION_COLUMNS
            ))?;
            let confirmations = stmt
                .query_map(params![bounty_id.to_string()], confirmation_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(confirmations)
        })
    }

    async fn approve_claim(&self, confirmation_id: Uuid, bounty_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            // Bounty first: a sibling approved earlier must read as `false`,
            // not trip the one-verified index.
            let confirmed = tx.execute(
                "UPDATE bounties SET status = 'confirmed' WHERE id = ?1 AND status = 'claimed'",
                params![bounty_id.to_string()],
            )?;
            if confirmed == 0 {
                return Ok(false);
            }

            let verified = tx.execute(
                "UPDATE confirmations SET verified = 1
                 WHERE id = ?1 AND bounty_id = ?2 AND verified = 0",
                params![confirmation_id.to_string(), bounty_id.to_string()],
            )?;
            if verified == 0 {
                // Dropping the transaction rolls back the status change.
                return Ok(false);
            }

            tx.commit()?;
            Ok(true)
        })
    }

    async fn reject_claim(
        &self,
        confirmation_id: Uuid,
        bounty_id: Uuid,
    ) -> Result<Option<BountyStatus>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let bounty_key = bounty_id.to_string();

            let deleted = tx.execute(
                "DELETE FROM confirmations WHERE id = ?1 AND bounty_id = ?2 AND verified = 0",
                params![confirmation_id.to_string(), bounty_key],
            )?;
            if deleted == 0 {
                return Ok(None);
            }

            let pending: i64 = tx.query_row(
                "SELECT COUNT(*) FROM confirmations WHERE bounty_id = ?1 AND verified = 0",
                params![bounty_key],
                |row| row.get(0),
            )?;
            if pending == 0 {
                tx.execute(
                    "UPDATE bounties SET status = 'active' WHERE id = ?1 AND status = 'claimed'",
                    params![bounty_key],
                )?;
            }

            let status: String = tx.query_row(
                "SELECT status FROM bounties WHERE id = ?1",
                params![bounty_key],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(Some(status.parse()?))
        })
    }

    async fn increment_reputation(&self, user_id: Uuid, delta: i64) -> Result<i64> {
        self.with_conn(|conn| {
            let reputation: Option<i64> = conn
                .query_row(
                    "UPDATE users SET reputation = reputation + ?2 WHERE id = ?1 RETURNING reputation",
                    params![user_id.to_string(), delta],
                    |row| row.get(0),
                )
                .optional()?;
            reputation.ok_or_else(|| BountyError::not_found("user", user_id))
        })
    }

    async fn apply_award(&self, award: &Award) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let journaled = tx.execute(
                "INSERT OR IGNORE INTO awards (confirmation_id, role, user_id, delta, awarded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    award.confirmation_id.to_string(),
                    award.role.as_str(),
                    award.user_id.to_string(),
                    award.delta,
                    ts(&award.awarded_at),
                ],
            )?;
            if journaled == 0 {
                return Ok(false);
            }

            let credited = tx.execute(
                "UPDATE users SET reputation = reputation + ?2 WHERE id = ?1",
                params![award.user_id.to_string(), award.delta],
            )?;
            if credited == 0 {
                return Err(BountyError::not_found("user", award.user_id));
            }

            tx.commit()?;
            Ok(true)
        })
    }

    async fn list_awards(&self, confirmation_id: Uuid) -> Result<Vec<Award>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT confirmation_id, role, user_id, delta, awarded_at
                 FROM awards WHERE confirmation_id = ?1 ORDER BY role",
            )?;
            let awards = stmt
                .query_map(params![confirmation_id.to_string()], |row| {
                    Ok(Award {
                        confirmation_id: col_uuid(row, 0)?,
                        role: col_parse(row, 1)?,
                        user_id: col_uuid(row, 2)?,
                        delta: row.get(3)?,
                        awarded_at: col_time(row, 4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(awards)
        })
    }

    async fn unsettled_confirmations(&self) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM confirmations c
                 LEFT JOIN awards a ON a.confirmation_id = c.id
                 WHERE c.verified = 1
                 GROUP BY c.id
                 HAVING COUNT(a.role) < 2",
            )?;
            let ids = stmt
                .query_map([], |row| col_uuid(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    async fn activate_session(
        &self,
        user_id: Uuid,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let user_key = user_id.to_string();
            let at = ts(&at);

            tx.execute(
                "UPDATE session_memberships SET is_active = 0, last_updated = ?3
                 WHERE user_id = ?1 AND session_id <> ?2 AND is_active = 1",
                params![user_key, session_id.as_str(), at],
            )?;
            tx.execute(
                "INSERT INTO session_memberships (user_id, session_id, is_active, last_updated)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(user_id, session_id)
                 DO UPDATE SET is_active = 1, last_updated = excluded.last_updated",
                params![user_key, session_id.as_str(), at],
            )?;

            tx.commit()?;
            Ok(())
        })
    }

    async fn deactivate_session(
        &self,
        user_id: Uuid,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE session_memberships SET is_active = 0, last_updated = ?3
                 WHERE user_id = ?1 AND session_id = ?2",
                params![user_id.to_string(), session_id.as_str(), ts(&at)],
            )?;
            Ok(updated > 0)
        })
    }

    async fn active_session(&self, user_id: Uuid) -> Result<Option<SessionMembership>> {
        self.with_conn(|conn| {
            let membership = conn
                .query_row(
                    "SELECT user_id, session_id, is_active, last_updated
                     FROM session_memberships WHERE user_id = ?1 AND is_active = 1",
                    params![user_id.to_string()],
                    membership_from_row,
                )
                .optional()?;
            Ok(membership)
        })
    }

    async fn active_members(&self, session_id: &SessionId) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM session_memberships
                 WHERE session_id = ?1 AND is_active = 1 ORDER BY last_updated",
            )?;
            let members = stmt
                .query_map(params![session_id.as_str()], |row| col_uuid(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(members)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActivePeriod, AwardRole};

    fn bounty(reporter: Uuid) -> Bounty {
        Bounty {
            id: Uuid::new_v4(),
            reporter_id: reporter,
            target_name: "Raider".to_string(),
            last_location: "North Base".to_string(),
            description: Some("camping the spawn".to_string()),
            proof_ref: None,
            reward_offer: Some("500 credits".to_string()),
            time_left_when_killed: Some(15),
            created_at: Utc::now(),
            active_period: ActivePeriod::Day,
            status: BountyStatus::Active,
            session_id: "ABCDE-1234".parse().unwrap(),
        }
    }

    fn claim(bounty_id: Uuid) -> Confirmation {
        Confirmation {
            id: Uuid::new_v4(),
            bounty_id,
            hunter_id: Uuid::new_v4(),
            proof_ref: "https://proofs.local/x.png".to_string(),
            session_id: "ABCDE-1234".parse().unwrap(),
            confirmed_at: Utc::now(),
            verified: false,
        }
    }

    #[tokio::test]
    async fn test_bounty_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let b = bounty(Uuid::new_v4());
        store.insert_bounty(&b).await.unwrap();

        let loaded = store.get_bounty(b.id).await.unwrap().unwrap();
        assert_eq!(loaded, b);
        assert!(store.get_bounty(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_user_keeps_reputation() {
        let store = SqliteStore::in_memory().unwrap();
        let mut user = User::new(Uuid::new_v4(), "alice");
        store.upsert_user(&user).await.unwrap();
        assert_eq!(store.increment_reputation(user.id, 7).await.unwrap(), 7);

        user.username = "alice2".to_string();
        user.reputation = 0;
        store.upsert_user(&user).await.unwrap();

        let loaded = store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(loaded.username, "alice2");
        assert_eq!(loaded.reputation, 7);
    }

    #[tokio::test]
    async fn test_increment_unknown_user_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.increment_reputation(Uuid::new_v4(), 1).await.unwrap_err();
        assert!(matches!(err, BountyError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_claim_then_approve_is_compare_and_swap() {
        let store = SqliteStore::in_memory().unwrap();
        let b = bounty(Uuid::new_v4());
        store.insert_bounty(&b).await.unwrap();

        let first = claim(b.id);
        let second = claim(b.id);
        assert!(store.insert_claim(&first).await.unwrap());
        assert!(store.insert_claim(&second).await.unwrap());

        assert!(store.approve_claim(first.id, b.id).await.unwrap());
        assert!(!store.approve_claim(first.id, b.id).await.unwrap());
        assert!(!store.approve_claim(second.id, b.id).await.unwrap());

        let second = store.get_confirmation(second.id).await.unwrap().unwrap();
        assert!(!second.verified);
        let b = store.get_bounty(b.id).await.unwrap().unwrap();
        assert_eq!(b.status, BountyStatus::Confirmed);

        // Closed bounties take no more claims.
        assert!(!store.insert_claim(&claim(b.id)).await.unwrap());
    }

    #[tokio::test]
    async fn test_reject_reverts_only_when_none_pending() {
        let store = SqliteStore::in_memory().unwrap();
        let b = bounty(Uuid::new_v4());
        store.insert_bounty(&b).await.unwrap();

        let first = claim(b.id);
        let second = claim(b.id);
        store.insert_claim(&first).await.unwrap();
        store.insert_claim(&second).await.unwrap();

        assert_eq!(
            store.reject_claim(first.id, b.id).await.unwrap(),
            Some(BountyStatus::Claimed)
        );
        assert_eq!(store.reject_claim(first.id, b.id).await.unwrap(), None);
        assert_eq!(
            store.reject_claim(second.id, b.id).await.unwrap(),
            Some(BountyStatus::Active)
        );
    }

    #[tokio::test]
    async fn test_award_journal_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let hunter = User::new(Uuid::new_v4(), "hunter");
        store.upsert_user(&hunter).await.unwrap();

        let b = bounty(Uuid::new_v4());
        store.insert_bounty(&b).await.unwrap();
        let mut c = claim(b.id);
        c.hunter_id = hunter.id;
        store.insert_claim(&c).await.unwrap();
        store.approve_claim(c.id, b.id).await.unwrap();
        assert_eq!(store.unsettled_confirmations().await.unwrap(), vec![c.id]);

        let award = Award {
            confirmation_id: c.id,
            role: AwardRole::Hunter,
            user_id: hunter.id,
            delta: 10,
            awarded_at: Utc::now(),
        };
        assert!(store.apply_award(&award).await.unwrap());
        assert!(!store.apply_award(&award).await.unwrap());

        let hunter = store.get_user(hunter.id).await.unwrap().unwrap();
        assert_eq!(hunter.reputation, 10);
        assert_eq!(store.list_awards(c.id).await.unwrap().len(), 1);
        // Reporter award still outstanding.
        assert_eq!(store.unsettled_confirmations().await.unwrap(), vec![c.id]);
    }

    #[tokio::test]
    async fn test_award_to_missing_user_rolls_back_journal() {
        let store = SqliteStore::in_memory().unwrap();
        let b = bounty(Uuid::new_v4());
        store.insert_bounty(&b).await.unwrap();
        let c = claim(b.id);
        store.insert_claim(&c).await.unwrap();

        let award = Award {
            confirmation_id: c.id,
            role: AwardRole::Reporter,
            user_id: Uuid::new_v4(),
            delta: 5,
            awarded_at: Utc::now(),
        };
        assert!(store.apply_award(&award).await.is_err());
        assert!(store.list_awards(c.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_active_session_per_user() {
        let store = SqliteStore::in_memory().unwrap();
        let user = Uuid::new_v4();
        let a: SessionId = "AAAAA-1111".parse().unwrap();
        let b: SessionId = "BBBBB-2222".parse().unwrap();

        store.activate_session(user, &a, Utc::now()).await.unwrap();
        store.activate_session(user, &b, Utc::now()).await.unwrap();
        store.activate_session(user, &a, Utc::now()).await.unwrap();

        assert_eq!(store.active_members(&a).await.unwrap(), vec![user]);
        assert!(store.active_members(&b).await.unwrap().is_empty());
        assert_eq!(
            store.active_session(user).await.unwrap().unwrap().session_id,
            a
        );
    }
}
