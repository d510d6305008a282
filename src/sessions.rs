//! In-memory registry of open form sessions.
//!
//! Each session sits behind its own async mutex so a slow scan on one form
//! never blocks another. Sessions left untouched longer than the idle TTL are
//! evicted; the number of open sessions is capped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::flow::FormSession;

pub type SharedSession = Arc<Mutex<FormSession>>;

#[derive(Debug)]
struct Entry {
    session: SharedSession,
    last_touched: Instant,
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, Entry>>>,
    idle_ttl: Duration,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(idle_ttl: Duration, max_sessions: usize) -> Self {
        Self {
            inner: Arc::default(),
            idle_ttl,
            max_sessions,
        }
    }

    /// Open a new form session and return its handle.
    ///
    /// Idle sessions are evicted first. Returns `None` when the registry is
    /// still full afterwards.
    pub async fn create(&self) -> Option<SharedSession> {
        let mut map = self.inner.write().await;
        self.evict_idle_locked(&mut map);
        if map.len() >= self.max_sessions {
            tracing::warn!("SessionRegistry: full ({} open)", map.len());
            return None;
        }

        let session = FormSession::new();
        let id = session.id;
        let shared = Arc::new(Mutex::new(session));
        map.insert(
            id,
            Entry {
                session: shared.clone(),
                last_touched: Instant::now(),
            },
        );
        tracing::debug!("SessionRegistry: opened {}", id);
        Some(shared)
    }

    /// Look up a session and mark it as used.
    pub async fn get(&self, id: &Uuid) -> Option<SharedSession> {
        let mut map = self.inner.write().await;
        let entry = map.get_mut(id)?;
        entry.last_touched = Instant::now();
        Some(entry.session.clone())
    }

    /// Close a session (quote submitted or abandoned).
    pub async fn remove(&self, id: &Uuid) -> Option<SharedSession> {
        let removed = self.inner.write().await.remove(id).map(|e| e.session);
        if removed.is_some() {
            tracing::debug!("SessionRegistry: closed {}", id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Drop sessions idle for longer than the TTL. Returns how many went.
    pub async fn evict_idle(&self) -> usize {
        let mut map = self.inner.write().await;
        self.evict_idle_locked(&mut map)
    }

    fn evict_idle_locked(&self, map: &mut HashMap<Uuid, Entry>) -> usize {
        let before = map.len();
        let ttl = self.idle_ttl;
        map.retain(|_, entry| entry.last_touched.elapsed() < ttl);
        let evicted = before - map.len();
        if evicted > 0 {
            tracing::info!("SessionRegistry: evicted {} idle sessions", evicted);
        }
        evicted
    }

    /// Periodically evict idle sessions for as long as the registry lives.
    pub fn spawn_reaper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                registry.evict_idle().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Duration::from_secs(60), 10)
    }

    #[tokio::test]
    async fn test_create_get_remove() {
        let registry = registry();
        let session = registry.create().await.unwrap();
        let id = session.lock().await.id;

        let fetched = registry.get(&id).await.unwrap();
        assert!(Arc::ptr_eq(&session, &fetched));
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove(&id).await.is_some());
        assert!(registry.get(&id).await.is_none());
        assert!(registry.remove(&id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_are_evicted() {
        let registry = registry();
        let stale = registry.create().await.unwrap();
        let stale_id = stale.lock().await.id;
        let active = registry.create().await.unwrap();
        let active_id = active.lock().await.id;

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(registry.get(&active_id).await.is_some());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(registry.evict_idle().await, 1);
        assert!(registry.get(&stale_id).await.is_none());
        assert!(registry.get(&active_id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_evicts_in_background() {
        let registry = registry();
        registry.create().await.unwrap();
        let reaper = registry.spawn_reaper(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(75)).await;
        assert_eq!(registry.len().await, 0);
        reaper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_rejects_until_idle_sessions_expire() {
        let registry = SessionRegistry::new(Duration::from_secs(60), 2);
        registry.create().await.unwrap();
        registry.create().await.unwrap();
        assert!(registry.create().await.is_none());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(registry.create().await.is_some());
        assert_eq!(registry.len().await, 1);
    }
}
