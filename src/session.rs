//! Dump and show orchestration

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{CaptureConfig, CompletionMode, Config, StorageBackend};
use crate::engine::{BrowsingContext, BrowsingEngine, HttpEngine};
use crate::recording::{CaptureRecorder, CaptureSummary};
use crate::replay::{ReplayHandle, ReplayInterceptor, ReplayStats};
use crate::storage::{MemoryStore, RecordStore, Session, SessionId, SqliteStore};
use crate::{Result, SiteDumpError};

/// Engine and store shared by every session
#[derive(Clone)]
pub struct Context {
    /// Source of browsing contexts
    pub engine: Arc<dyn BrowsingEngine>,
    /// Durable session and exchange storage
    pub store: Arc<dyn RecordStore>,
}

impl Context {
    /// Pair an engine with a store
    #[must_use]
    pub fn new(engine: Arc<dyn BrowsingEngine>, store: Arc<dyn RecordStore>) -> Self {
        Self { engine, store }
    }

    /// Build the configured store and the HTTP engine
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be opened
    pub fn from_config(config: &Config) -> Result<Self> {
        let store: Arc<dyn RecordStore> = match config.storage.backend {
            StorageBackend::Sqlite => Arc::new(SqliteStore::open(&config.storage.path)?),
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        };
        let engine = Arc::new(HttpEngine::new(
            config.engine.clone(),
            config.limits.max_response_size,
        ));

        Ok(Self::new(engine, store))
    }
}

/// Result of a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpReport {
    /// Session created for the dump
    pub session_id: SessionId,
    /// Normalized URL that was loaded
    pub base_url: String,
    /// Final counters; `None` when capture continues in the background
    pub summary: Option<CaptureSummary>,
}

/// Result of starting a show
#[derive(Debug, Clone, PartialEq)]
pub struct ShowReport {
    /// Session being replayed
    pub session_id: SessionId,
    /// URL the show navigated to
    pub base_url: String,
    /// Replay counters once the document loaded
    pub stats: ReplayStats,
}

struct ActiveShow {
    context: Box<dyn BrowsingContext>,
    replay: ReplayHandle,
}

impl ActiveShow {
    async fn close(self) -> ReplayStats {
        close_quietly(self.context.as_ref()).await;
        self.replay.finish().await
    }
}

/// Validate and normalize a dump target
///
/// Only absolute `http`/`https` URLs without credentials are accepted. The
/// result is the WHATWG serialization: scheme and host lowercased, IDN hosts
/// in punycode, the default port dropped, an empty path turned into `/`,
/// and unsafe path and query bytes percent-encoded. The fragment is dropped
/// since it never reaches the network.
///
/// # Errors
///
/// Returns `InvalidUrl` for anything else
pub fn normalize_base_url(input: &str) -> Result<String> {
    let invalid = |reason: &str| SiteDumpError::InvalidUrl {
        url: input.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }

    let mut url = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("only http and https are supported"));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(invalid("credentials are not supported"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }

    url.set_fragment(None);
    Ok(url.into())
}

async fn close_quietly(context: &dyn BrowsingContext) {
    if let Err(e) = context.close().await {
        warn!("Failed to close browsing context: {}", e);
    }
}

/// Runs dumps and shows against a shared engine and store
pub struct SessionController {
    context: Context,
    capture: CaptureConfig,
    max_response_size: usize,
    slots: Arc<Semaphore>,
    shows: DashMap<SessionId, ActiveShow>,
    lingering: Mutex<JoinSet<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SessionController {
    /// Create a controller using the capture and limit settings of `config`
    #[must_use]
    pub fn new(context: Context, config: &Config) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            context,
            capture: config.capture.clone(),
            max_response_size: config.limits.max_response_size,
            slots: Arc::new(Semaphore::new(config.limits.max_concurrent_sessions)),
            shows: DashMap::new(),
            lingering: Mutex::new(JoinSet::new()),
            shutdown_tx,
        }
    }

    /// Shared engine and store
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    async fn slot(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| SiteDumpError::Other("Session controller is shut down".to_string()))
    }

    /// Capture everything loading `url` produces into a new session
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl` before any session is created if `url` is
    /// malformed, a store error if the session cannot be created, and the
    /// engine's error if the context cannot be opened or navigation fails
    pub async fn dump(&self, url: &str) -> Result<DumpReport> {
        let base_url = normalize_base_url(url)?;
        let slot = self.slot().await?;

        let session_id = self.context.store.create_session(&base_url).await?;
        info!("dump({}): Loading {}", session_id, base_url);

        let browsing = self.context.engine.new_context().await?;
        let responses = match browsing.subscribe_responses() {
            Ok(responses) => responses,
            Err(e) => {
                close_quietly(browsing.as_ref()).await;
                return Err(e);
            }
        };

        let recorder = Arc::new(CaptureRecorder::new(
            session_id,
            Arc::clone(&self.context.store),
            self.max_response_size,
        ));
        let mut capture = recorder.attach(responses);

        if let Err(e) = browsing.navigate(&base_url).await {
            error!("dump({}): {}", session_id, e);
            close_quietly(browsing.as_ref()).await;
            let summary = capture.finish().await;
            debug!(
                "dump({}): Drained {} exchanges after failed navigation",
                session_id,
                summary.stored()
            );
            return Err(e);
        }

        match self.capture.completion {
            CompletionMode::NetworkIdle => {
                capture
                    .wait_idle(browsing.as_ref(), self.capture.idle(), self.capture.timeout())
                    .await;
                close_quietly(browsing.as_ref()).await;
                let summary = capture.finish().await;
                info!(
                    "dump({}): Complete, {} exchanges stored, {} dropped",
                    session_id,
                    summary.stored(),
                    summary.failed
                );

                Ok(DumpReport {
                    session_id,
                    base_url,
                    summary: Some(summary),
                })
            }
            CompletionMode::Load => {
                let linger = self.capture.linger();
                let mut shutdown_rx = self.shutdown_tx.subscribe();

                let mut lingering = self.lingering.lock().await;
                while lingering.try_join_next().is_some() {}
                lingering.spawn(async move {
                    let _slot = slot;
                    tokio::select! {
                        () = tokio::time::sleep(linger) => {}
                        _ = shutdown_rx.recv() => {
                            debug!("dump({}): Cut short by shutdown", session_id);
                        }
                    }
                    close_quietly(browsing.as_ref()).await;
                    let summary = capture.finish().await;
                    info!(
                        "dump({}): Background capture done, {} exchanges stored",
                        session_id,
                        summary.stored()
                    );
                });

                info!("dump({}): Loaded, capturing in background", session_id);
                Ok(DumpReport {
                    session_id,
                    base_url,
                    summary: None,
                })
            }
        }
    }

    /// Start replaying `session_id` in a fresh intercepting context
    ///
    /// The show stays active until [`SessionController::close_show`] or
    /// [`SessionController::shutdown`]. Starting a show for a session that
    /// is already showing replaces the previous one.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for an unknown id, a store error if the
    /// snapshot cannot be loaded, and the engine's error otherwise
    pub async fn show(&self, session_id: SessionId) -> Result<ShowReport> {
        let session = self
            .context
            .store
            .get_session(session_id)
            .await?
            .ok_or(SiteDumpError::SessionNotFound(session_id))?;
        let _slot = self.slot().await?;

        let interceptor =
            Arc::new(ReplayInterceptor::load(self.context.store.as_ref(), session_id).await?);

        let browsing = self.context.engine.new_context().await?;
        let requests = match browsing.enable_interception() {
            Ok(requests) => requests,
            Err(e) => {
                close_quietly(browsing.as_ref()).await;
                return Err(e);
            }
        };
        let replay = interceptor.attach(requests);

        if let Err(e) = browsing.navigate(&session.base_url).await {
            error!("show({}): {}", session_id, e);
            ActiveShow {
                context: browsing,
                replay,
            }
            .close()
            .await;
            return Err(e);
        }

        let stats = replay.stats();
        info!(
            "show({}): Showing {} ({} exchanges)",
            session_id, session.base_url, stats.size
        );

        let previous = self.shows.insert(
            session_id,
            ActiveShow {
                context: browsing,
                replay,
            },
        );
        if let Some(previous) = previous {
            debug!("show({}): Replacing previous show", session_id);
            previous.close().await;
        }

        Ok(ShowReport {
            session_id,
            base_url: session.base_url,
            stats,
        })
    }

    /// Close a running show
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if no show is active for `session_id`
    pub async fn close_show(&self, session_id: SessionId) -> Result<ReplayStats> {
        let (_, show) = self
            .shows
            .remove(&session_id)
            .ok_or(SiteDumpError::SessionNotFound(session_id))?;
        let stats = show.close().await;
        info!(
            "show({}): Closed, {} hits, {} misses",
            session_id, stats.hits, stats.misses
        );
        Ok(stats)
    }

    /// Sessions currently being shown, ascending
    #[must_use]
    pub fn active_shows(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.shows.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Every stored session, ascending by id
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.context.store.list_sessions().await
    }

    /// Stop accepting work, finish background captures and close every show
    pub async fn shutdown(&self) {
        self.slots.close();
        self.shutdown_tx.send(()).ok();

        let mut lingering = self.lingering.lock().await;
        while let Some(joined) = lingering.join_next().await {
            if let Err(e) = joined {
                error!("Background capture failed: {}", e);
            }
        }
        drop(lingering);

        for session_id in self.active_shows() {
            if let Some((_, show)) = self.shows.remove(&session_id) {
                show.close().await;
            }
        }
        info!("Session controller shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ScriptedEngine, ScriptedExchange};
    use crate::storage::contract::FailingStore;
    use std::time::Duration;

    fn config(completion: CompletionMode) -> Config {
        let mut config = Config::default();
        config.capture.completion = completion;
        config.capture.idle_ms = 50;
        config.capture.timeout_ms = 2_000;
        config.capture.linger_ms = 5_000;
        config
    }

    fn controller(engine: &ScriptedEngine, completion: CompletionMode) -> SessionController {
        let context = Context::new(Arc::new(engine.clone()), Arc::new(MemoryStore::new()));
        SessionController::new(context, &config(completion))
    }

    fn site(engine: &ScriptedEngine) {
        engine.site(
            "http://a.test/",
            vec![
                ScriptedExchange::get("http://a.test/", 200)
                    .header("Content-Type", "text/html")
                    .body("<script src=app.js></script>"),
                ScriptedExchange::get("http://a.test/app.js", 200)
                    .header("Content-Type", "text/javascript")
                    .body("run()")
                    .late(Duration::from_millis(80)),
            ],
        );
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("HTTP://Example.COM").unwrap(),
            "http://example.com/"
        );
        assert_eq!(
            normalize_base_url(" https://a.test:443/x?q=1 ").unwrap(),
            "https://a.test/x?q=1"
        );
        assert_eq!(
            normalize_base_url("http://a.test:8080/").unwrap(),
            "http://a.test:8080/"
        );
    }

    #[test]
    fn test_normalize_encodes_like_a_browser() {
        assert_eq!(
            normalize_base_url("http://example.com/a b").unwrap(),
            "http://example.com/a%20b"
        );
        assert_eq!(
            normalize_base_url("http://example.com/?q=\"x\"").unwrap(),
            "http://example.com/?q=%22x%22"
        );
        assert_eq!(
            normalize_base_url("https://ja.wikipedia.org/wiki/日本").unwrap(),
            "https://ja.wikipedia.org/wiki/%E6%97%A5%E6%9C%AC"
        );
        assert_eq!(
            normalize_base_url("http://a.test/page#section").unwrap(),
            "http://a.test/page"
        );

        let idn = normalize_base_url("http://例え.jp/").unwrap();
        assert!(idn.starts_with("http://xn--"), "{idn}");
        assert!(idn.ends_with(".jp/"), "{idn}");
    }

    #[test]
    fn test_normalize_rejects_malformed() {
        for input in ["", "not a url", "/relative", "ftp://a.test/", "http://user@a.test/"] {
            assert!(
                matches!(normalize_base_url(input), Err(SiteDumpError::InvalidUrl { .. })),
                "{input} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_url_creates_no_session() {
        let engine = ScriptedEngine::new();
        let controller = controller(&engine, CompletionMode::NetworkIdle);

        assert!(controller.dump("nope").await.is_err());
        assert!(controller.list_sessions().await.unwrap().is_empty());
        assert_eq!(engine.context_count(), 0);
    }

    #[tokio::test]
    async fn test_dump_waits_for_late_subresources() {
        let engine = ScriptedEngine::new();
        site(&engine);
        let controller = controller(&engine, CompletionMode::NetworkIdle);

        let report = controller.dump("http://a.test").await.unwrap();
        assert_eq!(report.base_url, "http://a.test/");
        assert_eq!(report.summary.unwrap().captured, 2);

        let stored = controller
            .context()
            .store
            .list_exchanges(report.session_id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_load_mode_returns_before_late_subresources() {
        let engine = ScriptedEngine::new();
        site(&engine);
        let controller = controller(&engine, CompletionMode::Load);

        let report = controller.dump("http://a.test/").await.unwrap();
        assert!(report.summary.is_none());

        tokio::time::sleep(Duration::from_millis(300)).await;
        controller.shutdown().await;

        let stored = controller
            .context()
            .store
            .list_exchanges(report.session_id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_navigation_failure_is_session_scoped() {
        let engine = ScriptedEngine::new();
        site(&engine);
        let controller = controller(&engine, CompletionMode::NetworkIdle);

        let failed = controller.dump("http://down.test/").await;
        assert!(matches!(failed, Err(SiteDumpError::Navigation { .. })));

        let report = controller.dump("http://a.test/").await.unwrap();
        assert_eq!(report.summary.unwrap().captured, 2);
        assert_eq!(controller.list_sessions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_session_store_failure_is_dump_scoped() {
        let engine = ScriptedEngine::new();
        site(&engine);
        let store = Arc::new(FailingStore::default());
        let context = Context::new(Arc::new(engine.clone()), store.clone());
        let controller = SessionController::new(context, &config(CompletionMode::NetworkIdle));

        store.reject_sessions(true);
        let failed = controller.dump("http://a.test/").await;
        assert!(matches!(failed, Err(SiteDumpError::StoreWrite(_))));
        assert_eq!(engine.context_count(), 0);

        store.reject_sessions(false);
        let report = controller.dump("http://a.test/").await.unwrap();
        assert_eq!(report.summary.unwrap().captured, 2);
        assert_eq!(controller.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_does_not_abort_dump() {
        let engine = ScriptedEngine::new();
        site(&engine);
        let store = Arc::new(FailingStore::rejecting(&["http://a.test/"]));
        let context = Context::new(Arc::new(engine.clone()), store.clone());
        let controller = SessionController::new(context, &config(CompletionMode::NetworkIdle));

        let report = controller.dump("http://a.test/").await.unwrap();
        let summary = report.summary.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.captured, 1);

        let stored = store.list_exchanges(report.session_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].url, "http://a.test/app.js");
    }

    #[tokio::test]
    async fn test_show_unknown_session() {
        let engine = ScriptedEngine::new();
        let controller = controller(&engine, CompletionMode::NetworkIdle);

        assert!(matches!(
            controller.show(42).await,
            Err(SiteDumpError::SessionNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_show_replays_and_closes() {
        let engine = ScriptedEngine::new();
        site(&engine);
        let controller = controller(&engine, CompletionMode::NetworkIdle);
        let dump = controller.dump("http://a.test/").await.unwrap();

        let show = controller.show(dump.session_id).await.unwrap();
        assert_eq!(show.stats.size, 2);
        assert_eq!(controller.active_shows(), vec![dump.session_id]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = controller.close_show(dump.session_id).await.unwrap();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 0);
        assert!(controller.active_shows().is_empty());
        assert!(controller.close_show(dump.session_id).await.is_err());
    }
}
