//! SQLite-backed record store

use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::{Exchange, RecordStore, Session, SessionId};
use crate::headers::HeaderList;
use crate::{Result, SiteDumpError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    base_url TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS exchanges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    request_url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    status INTEGER NOT NULL,
    charset TEXT,
    UNIQUE(session_id, request_url)
);
";

const UPSERT_EXCHANGE: &str = "
INSERT INTO exchanges (session_id, request_url, headers, body, status, charset)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(session_id, request_url) DO UPDATE SET
    headers = excluded.headers,
    body = excluded.body,
    status = excluded.status,
    charset = excluded.charset
";

/// Record store persisted in a SQLite database
///
/// The connection is shared behind a mutex; every call runs on the blocking
/// pool so async handlers never stall on disk I/O.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and bootstrap the schema
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or the schema applied
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        info!("Opened record store at {}", path.display());
        Self::bootstrap(conn)
    }

    /// Open a private in-memory database
    ///
    /// # Errors
    ///
    /// Returns error if the schema cannot be applied
    pub fn open_in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| SiteDumpError::StoreWrite("Store connection poisoned".to_string()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| SiteDumpError::StoreWrite(format!("Store task failed: {e}")))?
    }
}

impl RecordStore for SqliteStore {
    fn create_session<'a>(&'a self, base_url: &'a str) -> BoxFuture<'a, Result<SessionId>> {
        let base_url = base_url.to_string();
        async move {
            self.with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (base_url, created_at) VALUES (?1, ?2)",
                    params![base_url, Utc::now().to_rfc3339()],
                )?;
                let id = conn.last_insert_rowid();
                debug!("Created session {} for {}", id, base_url);
                Ok(id)
            })
            .await
        }
        .boxed()
    }

    fn get_session(&self, id: SessionId) -> BoxFuture<'_, Result<Option<Session>>> {
        async move {
            self.with_conn(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, base_url, created_at FROM sessions WHERE id = ?1",
                        params![id],
                        session_row,
                    )
                    .optional()?;
                row.map(SessionRow::into_session).transpose()
            })
            .await
        }
        .boxed()
    }

    fn list_sessions(&self) -> BoxFuture<'_, Result<Vec<Session>>> {
        async move {
            self.with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, base_url, created_at FROM sessions ORDER BY id")?;
                let rows = stmt.query_map([], session_row)?;
                let sessions: Result<Vec<Session>> =
                    rows.map(|row| row?.into_session()).collect();
                sessions
            })
            .await
        }
        .boxed()
    }

    fn upsert_exchange(&self, exchange: Exchange) -> BoxFuture<'_, Result<()>> {
        async move {
            let headers = exchange.headers.to_json()?;
            self.with_conn(move |conn| {
                conn.execute(
                    UPSERT_EXCHANGE,
                    params![
                        exchange.session_id,
                        exchange.url,
                        headers,
                        exchange.body.as_ref(),
                        exchange.status,
                        exchange.charset,
                    ],
                )?;
                Ok(())
            })
            .await
        }
        .boxed()
    }

    fn list_exchanges(&self, session_id: SessionId) -> BoxFuture<'_, Result<Vec<Exchange>>> {
        async move {
            self.with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT request_url, headers, body, status, charset
                     FROM exchanges WHERE session_id = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![session_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, u16>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })?;

                let exchanges: Result<Vec<Exchange>> = rows
                    .map(|row| {
                        let (url, headers, body, status, charset) = row?;
                        Ok(Exchange {
                            session_id,
                            url,
                            headers: HeaderList::from_json(&headers)?,
                            body: Bytes::from(body),
                            status,
                            charset,
                        })
                    })
                    .collect();
                exchanges
            })
            .await
        }
        .boxed()
    }
}

struct SessionRow {
    id: SessionId,
    base_url: String,
    created_at: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| {
                SiteDumpError::StoreRead(format!("Session {}: bad timestamp: {e}", self.id))
            })?
            .with_timezone(&Utc);

        Ok(Session {
            id: self.id,
            base_url: self.base_url,
            created_at,
        })
    }
}

fn session_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        base_url: row.get(1)?,
        created_at: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_session_ids_increase() {
        let store = SqliteStore::open_in_memory().unwrap();
        contract::session_ids_increase(&store).await;
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let store = SqliteStore::open_in_memory().unwrap();
        contract::upsert_replaces(&store).await;
    }

    #[tokio::test]
    async fn test_exchanges_are_session_scoped() {
        let store = SqliteStore::open_in_memory().unwrap();
        contract::exchanges_are_session_scoped(&store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_keep_one_row() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        contract::concurrent_upserts_keep_one_row(store).await;
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dumps.sqlite3");

        let id = {
            let store = SqliteStore::open(&path).unwrap();
            let id = store.create_session("http://example.com/").await.unwrap();
            let mut exchange = contract::exchange(id, "http://example.com/", b"<html>");
            exchange.charset = Some("UTF-8".to_string());
            exchange.headers = [("Set-Cookie", "a=1"), ("Set-Cookie", "b=2")]
                .into_iter()
                .collect();
            store.upsert_exchange(exchange).await.unwrap();
            id
        };

        let store = SqliteStore::open(&path).unwrap();
        let exchanges = store.list_exchanges(id).await.unwrap();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].charset.as_deref(), Some("UTF-8"));
        assert_eq!(exchanges[0].headers.len(), 2);
        assert_eq!(exchanges[0].body, Bytes::from_static(b"<html>"));
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dumps.sqlite3");

        let first = SqliteStore::open(&path)
            .unwrap()
            .create_session("http://a.test/")
            .await
            .unwrap();
        let second = SqliteStore::open(&path)
            .unwrap()
            .create_session("http://a.test/")
            .await
            .unwrap();

        assert!(second > first);
    }

    #[tokio::test]
    async fn test_upsert_for_unknown_session_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store
            .upsert_exchange(contract::exchange(42, "http://x.test/", b""))
            .await;

        assert!(matches!(result, Err(SiteDumpError::StoreWrite(_))));
    }
}
