//! In-memory record store

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;

use super::{Exchange, RecordStore, Session, SessionId};
use crate::{Result, SiteDumpError};

/// Record store kept entirely in process memory
///
/// Each (session, URL) key maps to exactly one map entry, so concurrent
/// upserts for the same key replace rather than duplicate.
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<SessionId, Session>,
    exchanges: DashMap<(SessionId, String), Exchange>,
    last_id: AtomicI64,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored exchanges across all sessions
    #[must_use]
    pub fn exchange_count(&self) -> usize {
        self.exchanges.len()
    }
}

impl RecordStore for MemoryStore {
    fn create_session<'a>(&'a self, base_url: &'a str) -> BoxFuture<'a, Result<SessionId>> {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.sessions.insert(
            id,
            Session {
                id,
                base_url: base_url.to_string(),
                created_at: Utc::now(),
            },
        );
        future::ready(Ok(id)).boxed()
    }

    fn get_session(&self, id: SessionId) -> BoxFuture<'_, Result<Option<Session>>> {
        let session = self.sessions.get(&id).map(|s| s.value().clone());
        future::ready(Ok(session)).boxed()
    }

    fn list_sessions(&self) -> BoxFuture<'_, Result<Vec<Session>>> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by_key(|s| s.id);
        future::ready(Ok(sessions)).boxed()
    }

    fn upsert_exchange(&self, exchange: Exchange) -> BoxFuture<'_, Result<()>> {
        let result = if self.sessions.contains_key(&exchange.session_id) {
            self.exchanges
                .insert((exchange.session_id, exchange.url.clone()), exchange);
            Ok(())
        } else {
            Err(SiteDumpError::StoreWrite(format!(
                "Unknown session {}",
                exchange.session_id
            )))
        };
        future::ready(result).boxed()
    }

    fn list_exchanges(&self, session_id: SessionId) -> BoxFuture<'_, Result<Vec<Exchange>>> {
        let exchanges = self
            .exchanges
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .map(|entry| entry.value().clone())
            .collect();
        future::ready(Ok(exchanges)).boxed()
    }
}
