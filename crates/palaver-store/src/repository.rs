//! The [`ChatStore`] repository facade.
//!
//! One `ChatStore` exists per user session.  It owns the database handle
//! behind a mutex (writes are serialized at the storage layer), the bounded
//! user cache (write-through: the cache is updated before the durable write,
//! and both always agree for entities inserted through the store), and the
//! latest-users live view.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use palaver_core::User;

use crate::cache::LruCache;
use crate::database::Database;
use crate::error::Result;

/// Alias resolving to the session's own user inside the user repository.
pub const CURRENT_USER_ALIAS: &str = "me";

/// Default capacity of the in-memory user cache.
pub const DEFAULT_USER_CACHE_CAPACITY: usize = 1000;

/// How many recently-touched users the live view publishes.
const LATEST_USERS_LIMIT: usize = 100;

struct Inner {
    db: Mutex<Database>,
    user_cache: Mutex<LruCache<String, User>>,
    latest_users: watch::Sender<Vec<User>>,
    current_user_id: Mutex<Option<String>>,
}

/// Cloneable handle to the repository layer.  All clones share one database
/// connection and one user cache.
#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<Inner>,
}

impl ChatStore {
    pub fn new(db: Database) -> Self {
        Self::with_cache_capacity(db, DEFAULT_USER_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(db: Database, user_cache_capacity: usize) -> Self {
        let (latest_users, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                db: Mutex::new(db),
                user_cache: Mutex::new(LruCache::new(user_cache_capacity)),
                latest_users,
                current_user_id: Mutex::new(None),
            }),
        }
    }

    /// Remember which real user id the [`CURRENT_USER_ALIAS`] resolves to.
    pub fn set_current_user_id(&self, user_id: impl Into<String>) {
        *self.inner.current_user_id.lock() = Some(user_id.into());
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.inner.current_user_id.lock().clone()
    }

    /// Live view of the most-recently-touched users.  Used elsewhere to
    /// opportunistically refresh denormalized user copies embedded in
    /// messages and members.
    pub fn observe_latest_users(&self) -> watch::Receiver<Vec<User>> {
        self.inner.latest_users.subscribe()
    }

    /// Drop every persisted row and the in-memory cache (logout path).
    pub fn clear_all(&self) -> Result<()> {
        {
            let db = self.inner.db.lock();
            db.clear_users()?;
            db.clear_channels()?;
            db.clear_messages()?;
            db.clear_reactions()?;
            db.clear_sync_state()?;
            db.clear_query_specs()?;
        }
        self.inner.user_cache.lock().clear();
        *self.inner.current_user_id.lock() = None;
        self.inner.latest_users.send_replace(Vec::new());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internal plumbing shared by the per-entity repository files
    // ------------------------------------------------------------------

    pub(crate) fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self.inner.db.lock();
        f(&db)
    }

    pub(crate) fn with_db_mut<T>(&self, f: impl FnOnce(&mut Database) -> Result<T>) -> Result<T> {
        let mut db = self.inner.db.lock();
        f(&mut db)
    }

    pub(crate) fn with_user_cache<T>(
        &self,
        f: impl FnOnce(&mut LruCache<String, User>) -> T,
    ) -> T {
        let mut cache = self.inner.user_cache.lock();
        f(&mut cache)
    }

    /// Resolve the current-user alias to the real id.  Returns `None` when
    /// the alias is used without a current user being set.
    pub(crate) fn resolve_user_id(&self, id: &str) -> Option<String> {
        if id == CURRENT_USER_ALIAS {
            self.current_user_id()
        } else {
            Some(id.to_string())
        }
    }

    /// Publish the cache's recency view to `observe_latest_users`
    /// subscribers.
    pub(crate) fn publish_latest_users(&self) {
        let recent = self.inner.user_cache.lock().recent(LATEST_USERS_LIMIT);
        self.inner.latest_users.send_replace(recent);
    }
}

// ---------------------------------------------------------------------------
// Row-mapping helpers shared by the per-entity files
// ---------------------------------------------------------------------------

pub(crate) fn ts_to_sql(value: &Option<DateTime<Utc>>) -> Option<String> {
    value.map(|dt| dt.to_rfc3339())
}

pub(crate) fn ts_from_sql(
    col: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| conversion_error(col, e))
        })
        .transpose()
}

pub(crate) fn json_to_sql<T: Serialize>(col: usize, value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| conversion_error(col, e))
}

pub(crate) fn json_from_sql<T: DeserializeOwned>(col: usize, value: String) -> rusqlite::Result<T> {
    serde_json::from_str(&value).map_err(|e| conversion_error(col, e))
}

pub(crate) fn conversion_error(
    col: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(err))
}
