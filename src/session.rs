//! Session registry
//!
//! Tracks which game session each hunter is "on duty" in. The store is the
//! source of truth; [`SessionCache`] mirrors it for low-latency lookups and is
//! invalidated on every registry write and refreshed on every registry read.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BountyError, Result};
use crate::expiration::Clock;
use crate::store::BountyStore;
use crate::types::SessionMembership;

lazy_static! {
    static ref SESSION_ID_PATTERN: Regex =
        Regex::new(r"^[A-Z0-9]{5}-[A-Z0-9]{4}$").expect("session id pattern compiles");
}

/// Game-round identifier in the `XXXXX-XXXX` form, always upper-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Upper-cases then validates against `^[A-Z0-9]{5}-[A-Z0-9]{4}$`.
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_uppercase();
        if SESSION_ID_PATTERN.is_match(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(BountyError::InvalidFormat(format!(
                "invalid session id '{}', expected XXXXX-XXXX",
                raw
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = BountyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = BountyError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Registry-owned mirror of each user's active membership.
///
/// `None` entries are cached too: "known to be off duty" is a valid answer.
/// Every write bumps a per-user version; a read-through fill only lands if
/// no write happened since the reader sampled the version.
#[derive(Debug, Default)]
pub struct SessionCache {
    slots: RwLock<HashMap<Uuid, Slot>>,
}

#[derive(Debug, Default)]
struct Slot {
    version: u64,
    membership: Option<Option<SessionMembership>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` on miss, `Some(None)` when the user is known to be off duty.
    pub fn get(&self, user_id: Uuid) -> Option<Option<SessionMembership>> {
        self.slots
            .read()
            .get(&user_id)
            .and_then(|slot| slot.membership.clone())
    }

    pub fn version(&self, user_id: Uuid) -> u64 {
        self.slots.read().get(&user_id).map_or(0, |slot| slot.version)
    }

    /// Unconditional write, used after the store has committed.
    pub fn put(&self, user_id: Uuid, membership: Option<SessionMembership>) {
        let mut slots = self.slots.write();
        let slot = slots.entry(user_id).or_default();
        slot.version += 1;
        slot.membership = Some(membership);
    }

    /// Fill from a store read started at `version`. Returns `false` when a
    /// write raced the read and the value was dropped.
    pub fn put_if_unchanged(
        &self,
        user_id: Uuid,
        version: u64,
        membership: Option<SessionMembership>,
    ) -> bool {
        let mut slots = self.slots.write();
        let slot = slots.entry(user_id).or_default();
        if slot.version != version {
            return false;
        }
        slot.membership = Some(membership);
        true
    }

    pub fn invalidate(&self, user_id: Uuid) {
        let mut slots = self.slots.write();
        let slot = slots.entry(user_id).or_default();
        slot.version += 1;
        slot.membership = None;
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|slot| slot.membership.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

pub struct SessionRegistry {
    store: Arc<dyn BountyStore>,
    clock: Arc<dyn Clock>,
    cache: SessionCache,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn BountyStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            cache: SessionCache::new(),
        }
    }

    /// Go on duty in `session_id`. Any other active session of the user is
    /// deactivated by the store in the same transaction.
    pub async fn set_active_session(&self, user_id: Uuid, session_id: &str) -> Result<SessionId> {
        let session_id = SessionId::parse(session_id)?;
        let at = self.clock.now();
        self.cache.invalidate(user_id);

        let written = self.store.activate_session(user_id, &session_id, at).await;
        // Fills that sampled the version before this point are discarded.
        match &written {
            Ok(()) => self.cache.put(
                user_id,
                Some(SessionMembership {
                    user_id,
                    session_id: session_id.clone(),
                    is_active: true,
                    last_updated: at,
                }),
            ),
            Err(_) => self.cache.invalidate(user_id),
        }
        written?;

        info!("User {} on duty in session {}", user_id, session_id);
        Ok(session_id)
    }

    /// Go off duty. Returns `false` if no such membership existed.
    pub async fn clear_active_session(&self, user_id: Uuid, session_id: &str) -> Result<bool> {
        let session_id = SessionId::parse(session_id)?;
        self.cache.invalidate(user_id);

        let updated = self
            .store
            .deactivate_session(user_id, &session_id, self.clock.now())
            .await;
        self.cache.invalidate(user_id);
        let updated = updated?;

        if updated {
            info!("User {} off duty in session {}", user_id, session_id);
        }
        Ok(updated)
    }

    /// Authoritative read. Refreshes the cache so a stale entry heals here,
    /// unless a write landed while the read was in flight.
    pub async fn get_active_session(&self, user_id: Uuid) -> Result<Option<SessionMembership>> {
        let version = self.cache.version(user_id);
        let membership = self.store.active_session(user_id).await?;
        if !self.cache.put_if_unchanged(user_id, version, membership.clone()) {
            debug!("Session of {} changed during read, not caching", user_id);
        }
        Ok(membership)
    }

    /// Low-latency read: cache first, registry on miss.
    pub async fn cached_active_session(&self, user_id: Uuid) -> Result<Option<SessionMembership>> {
        if let Some(hit) = self.cache.get(user_id) {
            debug!("Session cache hit for {}", user_id);
            return Ok(hit);
        }
        self.get_active_session(user_id).await
    }

    pub async fn active_members(&self, session_id: &SessionId) -> Result<Vec<Uuid>> {
        self.store.active_members(session_id).await
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiration::SystemClock;
    use crate::store::SqliteStore;
    use crate::types::User;

    #[test]
    fn test_session_id_format() {
        assert_eq!(SessionId::parse("ABCDE-1234").unwrap().as_str(), "ABCDE-1234");
        assert_eq!(SessionId::parse("abcde-1234").unwrap().as_str(), "ABCDE-1234");
        assert!(matches!(
            SessionId::parse("ABCDE1234"),
            Err(BountyError::InvalidFormat(_))
        ));
        assert!(SessionId::parse("ABCDE-12345").is_err());
        assert!(SessionId::parse("ABCD-1234").is_err());
        assert!(SessionId::parse("ABCDE-12_4").is_err());
        assert!(SessionId::parse("").is_err());
    }

    #[test]
    fn test_session_id_deserialize_normalizes() {
        let id: SessionId = serde_json::from_str("\"zzzzz-0000\"").unwrap();
        assert_eq!(id.as_str(), "ZZZZZ-0000");
        assert!(serde_json::from_str::<SessionId>("\"nope\"").is_err());
    }

    async fn registry() -> (SessionRegistry, Uuid) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let user = User::new(Uuid::new_v4(), "hunter");
        store.upsert_user(&user).await.unwrap();
        (SessionRegistry::new(store, Arc::new(SystemClock)), user.id)
    }

    #[tokio::test]
    async fn test_second_activation_replaces_first() {
        let (registry, user) = registry().await;

        registry.set_active_session(user, "AAAAA-1111").await.unwrap();
        registry.set_active_session(user, "bbbbb-2222").await.unwrap();

        let active = registry.get_active_session(user).await.unwrap().unwrap();
        assert_eq!(active.session_id.as_str(), "BBBBB-2222");

        let a = SessionId::parse("AAAAA-1111").unwrap();
        assert!(registry.active_members(&a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_goes_off_duty() {
        let (registry, user) = registry().await;

        registry.set_active_session(user, "AAAAA-1111").await.unwrap();
        assert!(registry.clear_active_session(user, "AAAAA-1111").await.unwrap());
        assert!(registry.get_active_session(user).await.unwrap().is_none());
        assert!(!registry.clear_active_session(user, "CCCCC-3333").await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_write_and_healed_on_read() {
        let (registry, user) = registry().await;

        assert!(registry.cached_active_session(user).await.unwrap().is_none());
        assert_eq!(registry.cache().get(user), Some(None));

        registry.set_active_session(user, "AAAAA-1111").await.unwrap();
        assert_eq!(
            registry.cache().get(user).unwrap().unwrap().session_id.as_str(),
            "AAAAA-1111"
        );
        registry.clear_active_session(user, "AAAAA-1111").await.unwrap();
        assert_eq!(registry.cache().get(user), None);
        registry.set_active_session(user, "AAAAA-1111").await.unwrap();

        let cached = registry.cached_active_session(user).await.unwrap().unwrap();
        assert_eq!(cached.session_id.as_str(), "AAAAA-1111");

        // A poisoned entry heals on the next authoritative read.
        registry.cache().put(user, None);
        let healed = registry.get_active_session(user).await.unwrap();
        assert!(healed.is_some());
        assert!(registry.cache().get(user).unwrap().is_some());
    }

    #[test]
    fn test_fill_racing_a_write_is_dropped() {
        let cache = SessionCache::new();
        let user = Uuid::new_v4();

        let sampled = cache.version(user);
        cache.invalidate(user);
        assert!(!cache.put_if_unchanged(user, sampled, None));
        assert_eq!(cache.get(user), None);

        let sampled = cache.version(user);
        assert!(cache.put_if_unchanged(user, sampled, None));
        assert_eq!(cache.get(user), Some(None));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_format_is_rejected_before_store() {
        let (registry, user) = registry().await;
        let err = registry.set_active_session(user, "ABCDE1234").await.unwrap_err();
        assert!(matches!(err, BountyError::InvalidFormat(_)));
    }
}
