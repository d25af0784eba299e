//! Rendering-session affinity.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::types::{JobId, Tier, UserId};

/// Identity a rendering session is pinned to.
///
/// Keeping one browser session per (user, tier, job) lets cookies and
/// solved challenges carry across pages of the same job, and attributes
/// rendering cost to the right account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: UserId,
    pub tier: Tier,
    pub job_id: Option<JobId>,
}

impl SessionKey {
    pub fn new(user_id: UserId, tier: Tier, job_id: Option<JobId>) -> Self {
        Self {
            user_id,
            tier,
            job_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderSession {
    pub id: String,
    pub created_at: Instant,
    pub last_used: Instant,
    pub uses: u32,
}

/// Concurrent store of live rendering sessions.
///
/// Backed by a sharded map, so lookups for different keys never contend.
/// Idle sessions expire after `idle_ttl`. Every [`SWEEP_EVERY`] new keys,
/// `record` sweeps the whole map so per-job keys that are never looked up
/// again do not accumulate.
pub struct SessionStore {
    sessions: DashMap<SessionKey, RenderSession>,
    idle_ttl: Duration,
    inserts: AtomicUsize,
}

/// New keys recorded between idle sweeps.
pub const SWEEP_EVERY: usize = 64;

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(10 * 60))
    }
}

impl SessionStore {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_ttl,
            inserts: AtomicUsize::new(0),
        }
    }

    /// Live session id for `key`, marking it used. Expired sessions are dropped.
    pub fn session_for(&self, key: &SessionKey) -> Option<String> {
        let now = Instant::now();
        let expired = {
            let mut entry = self.sessions.get_mut(key)?;
            if now.duration_since(entry.last_used) < self.idle_ttl {
                entry.last_used = now;
                entry.uses += 1;
                return Some(entry.id.clone());
            }
            true
        };
        if expired {
            self.sessions.remove(key);
        }
        None
    }

    /// Remember the session the renderer used for `key`.
    pub fn record(&self, key: SessionKey, session_id: impl Into<String>) {
        let session_id = session_id.into();
        let now = Instant::now();
        let inserted = match self.sessions.entry(key) {
            Entry::Occupied(mut entry) => {
                let s = entry.get_mut();
                if s.id != session_id {
                    s.id = session_id;
                    s.created_at = now;
                    s.uses = 0;
                }
                s.last_used = now;
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(RenderSession {
                    id: session_id,
                    created_at: now,
                    last_used: now,
                    uses: 0,
                });
                true
            }
        };

        // The entry guard is released above; sweeping while holding it deadlocks.
        if inserted && (self.inserts.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            let evicted = self.evict_idle();
            if evicted > 0 {
                debug!(evicted, remaining = self.sessions.len(), "Evicted idle render sessions");
            }
        }
    }

    pub fn invalidate(&self, key: &SessionKey) -> Option<RenderSession> {
        self.sessions.remove(key).map(|(_, s)| s)
    }

    /// Drop idle sessions. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let before = self.sessions.len();
        let ttl = self.idle_ttl;
        self.sessions.retain(|_, s| s.last_used.elapsed() < ttl);
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
