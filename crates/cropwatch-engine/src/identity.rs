//! Session identity resolution and cache scoping.
//!
//! The engine never owns authentication; it reads the current identity on
//! demand from a provider and derives a stable numeric user id from it.
//! Session stores are loose about the id type (number or numeric string),
//! so resolution coerces and falls back to guest on anything non-numeric.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// User id as a session store may hold it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    Number(i64),
    Text(String),
}

impl UserId {
    /// Numeric form, coercing numeric strings; `None` otherwise.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            UserId::Number(id) => Some(*id),
            UserId::Text(raw) => raw.trim().parse().ok(),
        }
    }
}

/// The authenticated user as the session store presents it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl UserProfile {
    pub fn with_id(id: i64) -> Self {
        Self {
            id: UserId::Number(id),
            username: None,
        }
    }
}

/// Read-only view of the current session.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<UserProfile>;

    fn is_authenticated(&self) -> bool {
        self.current_user().is_some()
    }
}

/// Stable numeric id of the current user, or `None` for guests and
/// non-numeric session ids.
pub fn resolve_user_id(identity: &dyn IdentityProvider) -> Option<i64> {
    identity.current_user().and_then(|user| user.id.as_i64())
}

/// Identity namespace for persisted snapshots. Guest is a valid
/// pseudo-identity so an anonymous session never reads another user's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    User(i64),
    Guest,
}

impl CacheScope {
    pub fn from_user(user: Option<i64>) -> Self {
        match user {
            Some(id) => CacheScope::User(id),
            None => CacheScope::Guest,
        }
    }

    pub fn user_id(self) -> Option<i64> {
        match self {
            CacheScope::User(id) => Some(id),
            CacheScope::Guest => None,
        }
    }

    /// Key fragment used in snapshot file names.
    pub fn key(self) -> String {
        match self {
            CacheScope::User(id) => id.to_string(),
            CacheScope::Guest => "guest".to_string(),
        }
    }
}

impl std::fmt::Display for CacheScope {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(&self.key())
    }
}

/// Fixed identity, for hosts whose session cannot change mid-run.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user: Option<UserProfile>,
}

impl StaticIdentity {
    pub fn authenticated(user: UserProfile) -> Self {
        Self { user: Some(user) }
    }

    pub fn guest() -> Self {
        Self { user: None }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<UserProfile> {
        self.user.clone()
    }
}

/// Swappable identity, for hosts where the account can change at runtime.
#[derive(Debug, Clone, Default)]
pub struct SharedIdentity {
    inner: Arc<RwLock<Option<UserProfile>>>,
}

impl SharedIdentity {
    pub fn new(user: Option<UserProfile>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(user)),
        }
    }

    pub fn set_user(&self, user: UserProfile) {
        *self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(user);
    }

    pub fn clear(&self) {
        *self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl IdentityProvider for SharedIdentity {
    fn current_user(&self) -> Option<UserProfile> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
