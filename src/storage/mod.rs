//! Persistent store for sessions and captured exchanges

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::headers::HeaderList;
use crate::Result;

/// Session identifier, assigned by the store and never reused
pub type SessionId = i64;

/// One dumped site
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Store-assigned identifier
    pub id: SessionId,
    /// Normalized absolute URL the dump started from
    pub base_url: String,
    /// When the dump was requested
    pub created_at: DateTime<Utc>,
}

/// One captured request/response pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// Owning session
    pub session_id: SessionId,
    /// Exact request URL, the only match key
    pub url: String,
    /// Response headers as observed
    pub headers: HeaderList,
    /// Response body (empty for preflights and non-success statuses)
    pub body: Bytes,
    /// HTTP status code
    pub status: u16,
    /// Recovered text encoding
    pub charset: Option<String>,
}

/// Durable mapping from (session, URL) to a captured exchange
///
/// Implementations must keep at most one exchange per (session, URL) even
/// under concurrent upserts for the same key.
pub trait RecordStore: Send + Sync {
    /// Insert a new session stamped with the current time
    fn create_session<'a>(&'a self, base_url: &'a str) -> BoxFuture<'a, Result<SessionId>>;

    /// Look up a single session
    fn get_session(&self, id: SessionId) -> BoxFuture<'_, Result<Option<Session>>>;

    /// All sessions, ordered by id
    fn list_sessions(&self) -> BoxFuture<'_, Result<Vec<Session>>>;

    /// Insert or replace the exchange for (session, URL)
    fn upsert_exchange(&self, exchange: Exchange) -> BoxFuture<'_, Result<()>>;

    /// Current snapshot of a session's exchanges
    fn list_exchanges(&self, session_id: SessionId) -> BoxFuture<'_, Result<Vec<Exchange>>>;
}
