//! Immutable per-show view of a session's exchanges

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::info;

use crate::storage::{Exchange, RecordStore, SessionId};
use crate::Result;

/// Exchanges of one session indexed by exact request URL
pub struct ReplaySnapshot {
    session_id: SessionId,
    entries: HashMap<String, Exchange>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    passed_through: AtomicUsize,
}

impl ReplaySnapshot {
    /// Build a snapshot from already loaded exchanges
    #[must_use]
    pub fn new(session_id: SessionId, exchanges: Vec<Exchange>) -> Self {
        let entries = exchanges
            .into_iter()
            .map(|exchange| (exchange.url.clone(), exchange))
            .collect();

        Self {
            session_id,
            entries,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            passed_through: AtomicUsize::new(0),
        }
    }

    /// Load every exchange of `session_id` from `store`
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub async fn load(store: &dyn RecordStore, session_id: SessionId) -> Result<Self> {
        let exchanges = store.list_exchanges(session_id).await?;
        let snapshot = Self::new(session_id, exchanges);

        info!(
            "show({}): Loaded {} exchanges",
            session_id,
            snapshot.size()
        );

        Ok(snapshot)
    }

    /// Session the snapshot was taken from
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Look up an exchange by byte-exact URL, counting the hit or miss
    #[must_use]
    pub fn lookup(&self, url: &str) -> Option<&Exchange> {
        let found = self.entries.get(url);
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Count a request let through without lookup
    pub fn record_pass_through(&self) {
        self.passed_through.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of stored exchanges
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> ReplayStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        ReplayStats {
            hits,
            misses,
            passed_through: self.passed_through.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            size: self.size(),
        }
    }
}

/// Replay statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayStats {
    /// Requests answered from the snapshot
    pub hits: usize,
    /// Requests answered with a synthesized 404
    pub misses: usize,
    /// Preflight requests let through
    pub passed_through: usize,
    /// Hit rate (0.0 to 1.0)
    pub hit_rate: f64,
    /// Snapshot size (number of exchanges)
    pub size: usize,
}
