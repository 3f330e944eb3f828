//! Working set of active sessions
//!
//! One `tokio::sync::Mutex<Session>` per user serializes turns for that user.
//! Sessions missing from the cache are rehydrated from the store on first
//! contact. Persistence is fire-and-forget with bounded retries; the store
//! keeps the highest revision, so a late write never clobbers a newer one.

use crate::runtime::traits::SessionStore;
use crate::runtime::{retry_with_backoff, RetryPolicy};
use crate::state_machine::Session;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type SessionHandle = Arc<tokio::sync::Mutex<Session>>;

struct Entry {
    session: SessionHandle,
    last_access: Instant,
}

pub struct SessionCache {
    store: Arc<dyn SessionStore>,
    retry: RetryPolicy,
    entries: Mutex<HashMap<String, Entry>>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn SessionStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, user_id: &str) -> Option<SessionHandle> {
        let mut entries = self.entries.lock().unwrap();
        entries.get_mut(user_id).map(|entry| {
            entry.last_access = Instant::now();
            entry.session.clone()
        })
    }

    /// Cached session, else the durable copy, else a fresh one.
    ///
    /// A store failure degrades to a fresh session. Its low revision keeps it
    /// from overwriting the durable copy until it has moved past it.
    pub async fn get_or_create(&self, user_id: &str) -> SessionHandle {
        if let Some(handle) = self.cached(user_id) {
            return handle;
        }

        let loaded = retry_with_backoff(self.retry, "load session", || {
            self.store.get_session(user_id)
        })
        .await;
        let session = match loaded {
            Ok(Some(session)) => {
                tracing::info!(
                    user_id = %user_id,
                    revision = session.revision,
                    "Session rehydrated"
                );
                session
            }
            Ok(None) => {
                tracing::info!(user_id = %user_id, "New session");
                Session::new(user_id)
            }
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    error = %e,
                    "Failed to load session, starting fresh"
                );
                Session::new(user_id)
            }
        };

        // Another task may have loaded the same user meanwhile; first one wins
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(user_id.to_string()).or_insert_with(|| Entry {
            session: Arc::new(tokio::sync::Mutex::new(session)),
            last_access: Instant::now(),
        });
        entry.last_access = Instant::now();
        entry.session.clone()
    }

    /// Copy of the session without creating one
    pub async fn snapshot(&self, user_id: &str) -> Result<Option<Session>, String> {
        if let Some(handle) = self.cached(user_id) {
            return Ok(Some(handle.lock().await.clone()));
        }
        self.store.get_session(user_id).await
    }

    /// Persist a copy of `session` in the background
    pub fn persist(&self, session: &Session) -> JoinHandle<()> {
        let store = self.store.clone();
        let retry = self.retry;
        let session = session.clone();
        tokio::spawn(async move {
            let result =
                retry_with_backoff(retry, "persist session", || store.put_session(&session)).await;
            match result {
                Ok(true) => {}
                Ok(false) => tracing::debug!(
                    user_id = %session.user_id,
                    revision = session.revision,
                    "Stale session write skipped"
                ),
                Err(e) => tracing::error!(
                    user_id = %session.user_id,
                    error = %e,
                    "Failed to persist session"
                ),
            }
        })
    }

    /// Drop sessions idle for at least `max_idle` that no task is using.
    /// Their durable copies stay in the store.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.last_access.elapsed() < max_idle || Arc::strong_count(&entry.session) > 1
        });
        before - entries.len()
    }

    /// Delete durable documents untouched since `older_than`
    pub async fn prune_durable(&self, older_than: DateTime<Utc>) -> Result<usize, String> {
        self.store.prune_sessions(older_than).await
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    #[allow(dead_code)] // Used in tests
    pub fn is_cached(&self, user_id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::runtime::testing::FlakySessionStore;
    use std::sync::atomic::Ordering;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn same_user_gets_the_same_handle() {
        let db = Database::open_in_memory().unwrap();
        let cache = SessionCache::new(Arc::new(db), fast_retry());
        let a = cache.get_or_create("u1").await;
        let b = cache.get_or_create("u1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn evicted_session_is_rehydrated_from_the_store() {
        let db = Database::open_in_memory().unwrap();
        let cache = SessionCache::new(Arc::new(db.clone()), fast_retry());
        {
            let handle = cache.get_or_create("u1").await;
            let mut session = handle.lock().await;
            session.select_persona_scenario("isabella", "cooking_class", "Hi.", "an apron");
            session.display_name = Some("Max".to_string());
            cache.persist(&session).await.unwrap();
        }

        assert_eq!(cache.evict_idle(Duration::ZERO), 1);
        assert!(!cache.is_cached("u1"));

        let handle = cache.get_or_create("u1").await;
        let session = handle.lock().await;
        assert_eq!(session.persona_id.as_deref(), Some("isabella"));
        assert_eq!(session.display_name.as_deref(), Some("Max"));
    }

    #[tokio::test]
    async fn sessions_in_use_are_not_evicted() {
        let db = Database::open_in_memory().unwrap();
        let cache = SessionCache::new(Arc::new(db), fast_retry());
        let held = cache.get_or_create("u1").await;
        assert_eq!(cache.evict_idle(Duration::ZERO), 0);
        drop(held);
        assert_eq!(cache.evict_idle(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn persist_retries_transient_failures() {
        let db = Database::open_in_memory().unwrap();
        let flaky = Arc::new(FlakySessionStore::new(db.clone(), 2));
        let cache = SessionCache::new(flaky.clone(), fast_retry());

        let mut session = Session::new("u1");
        session.bump();
        cache.persist(&session).await.unwrap();

        assert_eq!(flaky.put_attempts.load(Ordering::SeqCst), 3);
        assert!(db.get_session("u1").unwrap().is_some());
    }

    #[tokio::test]
    async fn older_revision_never_overwrites_newer() {
        let db = Database::open_in_memory().unwrap();
        let cache = SessionCache::new(Arc::new(db.clone()), fast_retry());

        let mut newer = Session::new("u1");
        newer.scenario_turns = 5;
        newer.revision = 4;
        let mut older = newer.clone();
        older.scenario_turns = 2;
        older.revision = 3;

        cache.persist(&newer).await.unwrap();
        cache.persist(&older).await.unwrap();

        let stored = db.get_session("u1").unwrap().unwrap();
        assert_eq!(stored.scenario_turns, 5);
    }
}
