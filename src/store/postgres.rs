//! PostgreSQL store
//!
//! Server-mode backend, selected when `DATABASE_URL` is set. Race-sensitive
//! operations run as single transactions that lock the bounty row first, so
//! they serialise against each other under READ COMMITTED.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::{NoTls, Row};
use tracing::info;
use uuid::Uuid;

use super::BountyStore;
use crate::error::{BountyError, Result};
use crate::session::SessionId;
use crate::types::{Award, Bounty, BountyStatus, Confirmation, SessionMembership, User};

const DB_POOL_MAX_SIZE: usize = 20;
const DB_QUERY_TIMEOUT_SECS: u64 = 30;

const SCHEMA_V1: &str = include_str!("../../migrations/postgres/001_schema.sql");

const BOUNTY_COLUMNS: &str = "id, reporter_id, target_name, last_location, description, proof_ref, \
     reward_offer, time_left_when_killed, created_at, active_period, status, session_id";

const CONFIRMATION_COLUMNS: &str =
    "id, bounty_id, hunter_id, proof_ref, session_id, confirmed_at, verified";

#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub async fn new(database_url: &str, max_pool_size: Option<usize>) -> Result<Self> {
        let pool_size = max_pool_size.unwrap_or(DB_POOL_MAX_SIZE);

        let mut config = Config::new();
        config.url = Some(database_url.to_string());
        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        config.pool = Some(PoolConfig {
            max_size: pool_size,
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(Duration::from_secs(DB_QUERY_TIMEOUT_SECS)),
                create: Some(Duration::from_secs(10)),
                recycle: Some(Duration::from_secs(30)),
            },
            ..Default::default()
        });

        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| BountyError::UpstreamFailure(format!("postgres pool: {}", e)))?;

        let client = pool.get().await?;
        client
            .execute(
                &format!("SET statement_timeout = '{}s'", DB_QUERY_TIMEOUT_SECS),
                &[],
            )
            .await?;

        info!(
            "Connected to PostgreSQL (pool_size: {}, query_timeout: {}s)",
            pool_size, DB_QUERY_TIMEOUT_SECS
        );

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<()> {
        let client = self.pool.get().await?;

        let exists: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_name = 'schema_migrations')",
                &[],
            )
            .await?
            .get(0);

        if !exists {
            client.batch_execute(SCHEMA_V1).await?;
            info!("Applied migration 001_schema");
        }
        Ok(())
    }
}

fn bounty_from_row(row: &Row) -> Result<Bounty> {
    Ok(Bounty {
        id: row.get(0),
        reporter_id: row.get(1),
        target_name: row.get(2),
        last_location: row.get(3),
        description: row.get(4),
        proof_ref: row.get(5),
        reward_offer: row.get(6),
        time_left_when_killed: row.get(7),
        created_at: row.get(8),
        active_period: row.get(9),
        status: row.get(10),
        session_id: SessionId::parse(row.get(11))?,
    })
}

fn confirmation_from_row(row: &Row) -> Result<Confirmation> {
    Ok(Confirmation {
        id: row.get(0),
        bounty_id: row.get(1),
        hunter_id: row.get(2),
        proof_ref: row.get(3),
        session_id: SessionId::parse(row.get(4))?,
        confirmed_at: row.get(5),
        verified: row.get(6),
    })
}

#[async_trait]
impl BountyStore for PgStore {
    async fn upsert_user(&self, user: &User) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO users (id, username, reputation, role) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (id) DO UPDATE SET username = EXCLUDED.username, role = EXCLUDED.role",
                &[&user.id, &user.username, &user.reputation, &user.role],
            )
            .await?;
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, username, reputation, role FROM users WHERE id = $1",
                &[&id],
            )
            .await?;

        Ok(row.map(|r| User {
            id: r.get(0),
            username: r.get(1),
            reputation: r.get(2),
            role: r.get(3),
        }))
    }

    async fn insert_bounty(&self, bounty: &Bounty) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                &format!(
                    "INSERT INTO bounties ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                    BOUNTY_COLUMNS
                ),
                &[
                    &bounty.id,
                    &bounty.reporter_id,
                    &bounty.target_name,
                    &bounty.last_location,
                    &bounty.description,
                    &bounty.proof_ref,
                    &bounty.reward_offer,
                    &bounty.time_left_when_killed,
                    &bounty.created_at,
                    &bounty.active_period,
                    &bounty.status,
                    &bounty.session_id.as_str(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_bounty(&self, id: Uuid) -> Result<Option<Bounty>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM bounties WHERE id = $1", BOUNTY_COLUMNS),
                &[&id],
            )
            .await?;
        row.as_ref().map(bounty_from_row).transpose()
    }

    async fn list_bounties(&self, status: Option<BountyStatus>) -> Result<Vec<Bounty>> {
        let client = self.pool.get().await?;
        let rows = match status {
            Some(status) => {
                client
                    .query(
                        &format!(
                            "SELECT {} FROM bounties WHERE status = $1 ORDER BY created_at DESC",
                            BOUNTY_COLUMNS
                        ),
                        &[&status],
                    )
                    .await?
            }
            None => {
                client
                    .query(
                        &format!(
                            "SELECT {} FROM bounties ORDER BY created_at DESC",
                            BOUNTY_COLUMNS
                        ),
                        &[],
                    )
                    .await?
            }
        };
        rows.iter().map(bounty_from_row).collect()
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: BountyStatus,
        to: BountyStatus,
    ) -> Result<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE bounties SET status = $3 WHERE id = $1 AND status = $2",
                &[&id, &from, &to],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn insert_claim(&self, confirmation: &Confirmation) -> Result<bool> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let claimed = tx
            .execute(
                "UPDATE bounties SET status = 'claimed'
                 WHERE id = $1 AND status IN ('active', 'claimed')",
                &[&confirmation.bounty_id],
            )
            .await?;
        if claimed == 0 {
            return Ok(false);
        }

        tx.execute(
            &format!(
                "INSERT INTO confirmations ({}) VALUES ($1, $2, $3, $4, $5, $6, FALSE)",
                CONFIRMATION_COLUMNS
            ),
            &[
                &confirmation.id,
                &confirmation.bounty_id,
                &confirmation.hunter_id,
                &confirmation.proof_ref,
                &confirmation.session_id.as_str(),
                &confirmation.confirmed_at,
            ],
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_confirmation(&self, id: Uuid) -> Result<Option<Confirmation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM confirmations WHERE id = $1",
                    CONFIRMATION_COLUMNS
                ),
                &[&id],
            )
            .await?;
        row.as_ref().map(confirmation_from_row).transpose()
    }

    async fn list_confirmations(&self, bounty_id: Uuid) -> Result<Vec<Confirmation>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM confirmations WHERE bounty_id = $1 ORDER BY confirmed_at DESC",
                    CONFIRMATION_COLUMNS
                ),
                &[&bounty_id],
            )
            .await?;
        rows.iter().map(confirmation_from_row).collect()
    }

    async fn approve_claim(&self, confirmation_id: Uuid, bounty_id: Uuid) -> Result<bool> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let locked = tx
            .query_opt(
                "SELECT status FROM bounties WHERE id = $1 AND status = 'claimed' FOR UPDATE",
                &[&bounty_id],
            )
            .await?;
        if locked.is_none() {
            return Ok(false);
        }

        let verified = tx
            .execute(
                "UPDATE confirmations SET verified = TRUE
                 WHERE id = $1 AND bounty_id = $2 AND verified = FALSE",
                &[&confirmation_id, &bounty_id],
            )
            .await?;
        if verified == 0 {
            return Ok(false);
        }

        tx.execute(
            "UPDATE bounties SET status = 'confirmed' WHERE id = $1",
            &[&bounty_id],
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn reject_claim(
        &self,
        confirmation_id: Uuid,
        bounty_id: Uuid,
    ) -> Result<Option<BountyStatus>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Lock the bounty so a concurrent claim cannot slip in between the
        // pending count and the revert.
        let locked = tx
            .query_opt(
                "SELECT status FROM bounties WHERE id = $1 FOR UPDATE",
                &[&bounty_id],
            )
            .await?;
        if locked.is_none() {
            return Ok(None);
        }

        let deleted = tx
            .execute(
                "DELETE FROM confirmations WHERE id = $1 AND bounty_id = $2 AND verified = FALSE",
                &[&confirmation_id, &bounty_id],
            )
            .await?;
        if deleted == 0 {
            return Ok(None);
        }

        let pending: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM confirmations WHERE bounty_id = $1 AND verified = FALSE",
                &[&bounty_id],
            )
            .await?
            .get(0);

        if pending == 0 {
            tx.execute(
                "UPDATE bounties SET status = 'active' WHERE id = $1 AND status = 'claimed'",
                &[&bounty_id],
            )
            .await?;
        }

        let status: BountyStatus = tx
            .query_one("SELECT status FROM bounties WHERE id = $1", &[&bounty_id])
            .await?
            .get(0);

        tx.commit().await?;
        Ok(Some(status))
    }

    async fn increment_reputation(&self, user_id: Uuid, delta: i64) -> Result<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE users SET reputation = reputation + $2 WHERE id = $1 RETURNING reputation",
                &[&user_id, &delta],
            )
            .await?;
        row.map(|r| r.get(0))
            .ok_or_else(|| BountyError::not_found("user", user_id))
    }

    async fn apply_award(&self, award: &Award) -> Result<bool> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let journaled = tx
            .execute(
                "INSERT INTO awards (confirmation_id, role, user_id, delta, awarded_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (confirmation_id, role) DO NOTHING",
                &[
                    &award.confirmation_id,
                    &award.role.as_str(),
                    &award.user_id,
                    &award.delta,
                    &award.awarded_at,
                ],
            )
            .await?;
        if journaled == 0 {
            return Ok(false);
        }

        let credited = tx
            .execute(
                "UPDATE users SET reputation = reputation + $2 WHERE id = $1",
                &[&award.user_id, &award.delta],
            )
            .await?;
        if credited == 0 {
            return Err(BountyError::not_found("user", award.user_id));
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_awards(&self, confirmation_id: Uuid) -> Result<Vec<Award>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT confirmation_id, role, user_id, delta, awarded_at
                 FROM awards WHERE confirmation_id = $1 ORDER BY role",
                &[&confirmation_id],
            )
            .await?;

        rows.iter()
            .map(|r| {
                let role: String = r.get(1);
                Ok(Award {
                    confirmation_id: r.get(0),
                    role: role.parse()?,
                    user_id: r.get(2),
                    delta: r.get(3),
                    awarded_at: r.get(4),
                })
            })
            .collect()
    }

    async fn unsettled_confirmations(&self) -> Result<Vec<Uuid>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT c.id FROM confirmations c
                 LEFT JOIN awards a ON a.confirmation_id = c.id
                 WHERE c.verified
                 GROUP BY c.id
                 HAVING COUNT(a.role) < 2",
                &[],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn activate_session(
        &self,
        user_id: Uuid,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Serialise activations of the same user.
        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtext($1::text))",
            &[&user_id.to_string()],
        )
        .await?;
        tx.execute(
            "UPDATE session_memberships SET is_active = FALSE, last_updated = $3
             WHERE user_id = $1 AND session_id <> $2 AND is_active",
            &[&user_id, &session_id.as_str(), &at],
        )
        .await?;
        tx.execute(
            "INSERT INTO session_memberships (user_id, session_id, is_active, last_updated)
             VALUES ($1, $2, TRUE, $3)
             ON CONFLICT (user_id, session_id)
             DO UPDATE SET is_active = TRUE, last_updated = EXCLUDED.last_updated",
            &[&user_id, &session_id.as_str(), &at],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn deactivate_session(
        &self,
        user_id: Uuid,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE session_memberships SET is_active = FALSE, last_updated = $3
                 WHERE user_id = $1 AND session_id = $2",
                &[&user_id, &session_id.as_str(), &at],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn active_session(&self, user_id: Uuid) -> Result<Option<SessionMembership>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT user_id, session_id, is_active, last_updated
                 FROM session_memberships WHERE user_id = $1 AND is_active",
                &[&user_id],
            )
            .await?;

        row.map(|r| {
            Ok(SessionMembership {
                user_id: r.get(0),
                session_id: SessionId::parse(r.get(1))?,
                is_active: r.get(2),
                last_updated: r.get(3),
            })
        })
        .transpose()
    }

    async fn active_members(&self, session_id: &SessionId) -> Result<Vec<Uuid>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT user_id FROM session_memberships
                 WHERE session_id = $1 AND is_active ORDER BY last_updated",
                &[&session_id.as_str()],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }
}
