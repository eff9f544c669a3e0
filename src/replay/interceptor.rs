//! Answers intercepted requests from a snapshot

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::snapshot::{ReplaySnapshot, ReplayStats};
use crate::engine::{Disposition, InterceptedRequest, SyntheticResponse};
use crate::headers::{self, HeaderList};
use crate::storage::{RecordStore, SessionId};
use crate::Result;

/// Body of the synthesized response for unknown URLs
pub const NOT_FOUND_BODY: &[u8] = b"Not found";

/// Lifecycle of a replay interceptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorState {
    /// Snapshot loaded, not yet attached to a context
    Loaded,
    /// Answering requests
    Intercepting,
    /// Request stream closed
    Closed,
}

/// How a single intercepted request was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Preflight let through unmodified
    PassedThrough,
    /// Answered with the stored exchange
    Replayed {
        /// Stored status code
        status: u16,
    },
    /// No stored exchange; answered with 404
    NotFound,
}

/// Replay pipeline for one show session
pub struct ReplayInterceptor {
    snapshot: ReplaySnapshot,
    state: Mutex<InterceptorState>,
}

impl ReplayInterceptor {
    /// Load the snapshot for `session_id`
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub async fn load(store: &dyn RecordStore, session_id: SessionId) -> Result<Self> {
        Ok(Self::from_snapshot(
            ReplaySnapshot::load(store, session_id).await?,
        ))
    }

    /// Wrap an already built snapshot
    #[must_use]
    pub fn from_snapshot(snapshot: ReplaySnapshot) -> Self {
        Self {
            snapshot,
            state: Mutex::new(InterceptorState::Loaded),
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> InterceptorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: InterceptorState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> ReplayStats {
        self.snapshot.stats()
    }

    /// Decide the disposition for a request
    ///
    /// Preflights pass through. Everything else is matched against the
    /// snapshot by exact URL.
    #[must_use]
    pub fn resolve(&self, method: &str, url: &str) -> (Disposition, ReplayOutcome) {
        if method.eq_ignore_ascii_case("OPTIONS") {
            self.snapshot.record_pass_through();
            return (Disposition::Continue, ReplayOutcome::PassedThrough);
        }

        match self.snapshot.lookup(url) {
            Some(exchange) => {
                let response = SyntheticResponse {
                    status: exchange.status,
                    headers: headers::sanitize(&exchange.headers, exchange.charset.as_deref()),
                    body: (!exchange.body.is_empty()).then(|| exchange.body.clone()),
                };
                (
                    Disposition::Respond(response),
                    ReplayOutcome::Replayed {
                        status: exchange.status,
                    },
                )
            }
            None => (Disposition::Respond(not_found()), ReplayOutcome::NotFound),
        }
    }

    /// Answer one intercepted request
    pub fn handle(&self, request: InterceptedRequest) -> ReplayOutcome {
        let session_id = self.snapshot.session_id();
        let (disposition, outcome) = self.resolve(request.method(), request.url());

        match outcome {
            ReplayOutcome::PassedThrough => {
                debug!("show({}): Preflight: {}", session_id, request.url());
            }
            ReplayOutcome::Replayed { status } => {
                debug!("show({}): Served({}): {}", session_id, status, request.url());
            }
            ReplayOutcome::NotFound => {
                warn!("show({}): Not found: {}", session_id, request.url());
            }
        }

        request.dispose(disposition);
        outcome
    }

    /// Start answering `requests` as they arrive
    #[must_use]
    pub fn attach(self: Arc<Self>, requests: mpsc::Receiver<InterceptedRequest>) -> ReplayHandle {
        self.set_state(InterceptorState::Intercepting);
        let driver = tokio::spawn(drive(Arc::clone(&self), requests));
        ReplayHandle {
            interceptor: self,
            driver,
        }
    }
}

async fn drive(
    interceptor: Arc<ReplayInterceptor>,
    mut requests: mpsc::Receiver<InterceptedRequest>,
) {
    while let Some(request) = requests.recv().await {
        interceptor.handle(request);
    }

    interceptor.set_state(InterceptorState::Closed);
    let stats = interceptor.stats();
    info!(
        "show({}): Closed after {} hits, {} misses",
        interceptor.snapshot.session_id(),
        stats.hits,
        stats.misses
    );
}

/// Synthesized response for URLs absent from the snapshot
#[must_use]
pub fn not_found() -> SyntheticResponse {
    let mut headers = HeaderList::new();
    headers.push("Content-Type", "text/plain");
    SyntheticResponse {
        status: 404,
        headers,
        body: Some(bytes::Bytes::from_static(NOT_FOUND_BODY)),
    }
}

/// Handle to a running replay
pub struct ReplayHandle {
    interceptor: Arc<ReplayInterceptor>,
    driver: JoinHandle<()>,
}

impl ReplayHandle {
    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> InterceptorState {
        self.interceptor.state()
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> ReplayStats {
        self.interceptor.stats()
    }

    /// Wait for the request stream to close
    ///
    /// The owning context must be closed first.
    pub async fn finish(self) -> ReplayStats {
        if let Err(e) = self.driver.await {
            error!("Replay driver failed: {}", e);
        }
        self.interceptor.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Exchange;
    use bytes::Bytes;

    fn interceptor(exchanges: Vec<Exchange>) -> ReplayInterceptor {
        ReplayInterceptor::from_snapshot(ReplaySnapshot::new(1, exchanges))
    }

    fn stored(
        url: &str,
        headers: HeaderList,
        body: &'static [u8],
        charset: Option<&str>,
    ) -> Exchange {
        Exchange {
            session_id: 1,
            url: url.to_string(),
            headers,
            body: Bytes::from_static(body),
            status: 200,
            charset: charset.map(str::to_string),
        }
    }

    #[test]
    fn test_miss_is_not_found() {
        let interceptor = interceptor(vec![]);
        let (disposition, outcome) = interceptor.resolve("GET", "http://a.test/missing");

        assert_eq!(outcome, ReplayOutcome::NotFound);
        let Disposition::Respond(response) = disposition else {
            panic!("expected a synthesized response");
        };
        assert_eq!(response.status, 404);
        assert_eq!(response.headers.content_type(), Some("text/plain"));
        assert_eq!(response.body.as_deref(), Some(&b"Not found"[..]));
    }

    #[test]
    fn test_hit_sanitizes_and_adds_charset() {
        let headers = vec![
            ("Content-Type".to_string(), "text/html".to_string()),
            ("X-Evil".to_string(), "a\r\nb".to_string()),
        ]
        .into();
        let interceptor = interceptor(vec![stored(
            "http://a.test/",
            headers,
            b"<p>hi</p>",
            Some("utf-8"),
        )]);

        let (disposition, outcome) = interceptor.resolve("GET", "http://a.test/");
        assert_eq!(outcome, ReplayOutcome::Replayed { status: 200 });
        let Disposition::Respond(response) = disposition else {
            panic!("expected a synthesized response");
        };
        assert_eq!(
            response.headers.content_type(),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(response.headers.get("X-Evil"), Some("ab"));
        assert_eq!(response.body.as_deref(), Some(&b"<p>hi</p>"[..]));
    }

    #[test]
    fn test_empty_body_means_no_body() {
        let interceptor = interceptor(vec![stored(
            "http://a.test/204",
            HeaderList::new(),
            b"",
            None,
        )]);
        let (disposition, _) = interceptor.resolve("GET", "http://a.test/204");
        let Disposition::Respond(response) = disposition else {
            panic!("expected a synthesized response");
        };
        assert_eq!(response.body, None);
    }

    #[test]
    fn test_preflight_passes_through() {
        let interceptor = interceptor(vec![stored(
            "http://a.test/api",
            HeaderList::new(),
            b"",
            None,
        )]);
        let (disposition, outcome) = interceptor.resolve("OPTIONS", "http://a.test/api");

        assert_eq!(disposition, Disposition::Continue);
        assert_eq!(outcome, ReplayOutcome::PassedThrough);
        assert_eq!(interceptor.stats().passed_through, 1);
        assert_eq!(interceptor.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_attached_interceptor_answers_and_closes() {
        let interceptor = Arc::new(interceptor(vec![stored(
            "http://a.test/",
            HeaderList::new(),
            b"x",
            None,
        )]));
        assert_eq!(interceptor.state(), InterceptorState::Loaded);

        let (tx, rx) = mpsc::channel(4);
        let handle = Arc::clone(&interceptor).attach(rx);
        assert_eq!(handle.state(), InterceptorState::Intercepting);

        let (request, decision) =
            InterceptedRequest::new("http://a.test/", "GET", HeaderList::new());
        tx.send(request).await.unwrap();
        assert!(matches!(decision.await.unwrap(), Disposition::Respond(_)));

        drop(tx);
        let stats = handle.finish().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(interceptor.state(), InterceptorState::Closed);
    }
}
