//! Deterministic engine that plays back a fixed script
//!
//! Each site is a list of exchanges; the first one is the primary document.
//! Exchanges marked late are delivered only after navigation has returned,
//! which reproduces the race between page load and subresource capture.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::{
    BrowsingContext, BrowsingEngine, Disposition, InterceptedRequest, ResponseEvent,
    EVENT_QUEUE_DEPTH,
};
use crate::headers::HeaderList;
use crate::{Result, SiteDumpError};

/// One scripted request/response pair
#[derive(Debug, Clone)]
pub struct ScriptedExchange {
    url: String,
    method: String,
    status: u16,
    headers: HeaderList,
    body: Bytes,
    body_fails: bool,
    delay: Option<Duration>,
}

impl ScriptedExchange {
    /// A `GET` answered with `status`
    #[must_use]
    pub fn get(url: impl Into<String>, status: u16) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            status,
            headers: HeaderList::new(),
            body: Bytes::new(),
            body_fails: false,
            delay: None,
        }
    }

    /// Override the request method
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Add a response header
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    /// Set the response body
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Make reading the body fail
    #[must_use]
    pub fn failing_body(mut self) -> Self {
        self.body_fails = true;
        self
    }

    /// Deliver this exchange `delay` after navigation returns
    #[must_use]
    pub fn late(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// What an interceptor decided for one scripted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedDisposition {
    /// Request URL
    pub url: String,
    /// Request method
    pub method: String,
    /// Decision received
    pub disposition: Disposition,
}

/// Engine that replays a fixed script instead of touching the network
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    sites: Arc<Mutex<HashMap<String, Vec<ScriptedExchange>>>>,
    observed: Arc<Mutex<Vec<ObservedDisposition>>>,
    contexts: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    /// Create an engine with no sites
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script what navigating to `url` produces; the first exchange is the document
    pub fn site(&self, url: impl Into<String>, exchanges: Vec<ScriptedExchange>) {
        self.sites
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), exchanges);
    }

    /// Every disposition received from interceptors, in arrival order
    #[must_use]
    pub fn observed(&self) -> Vec<ObservedDisposition> {
        self.observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of contexts created so far
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.contexts.load(Ordering::SeqCst)
    }
}

impl BrowsingEngine for ScriptedEngine {
    fn new_context(&self) -> BoxFuture<'_, Result<Box<dyn BrowsingContext>>> {
        self.contexts.fetch_add(1, Ordering::SeqCst);
        let context = ScriptedContext {
            inner: Arc::new(ScriptedInner {
                engine: self.clone(),
                responses: Mutex::new(Vec::new()),
                interceptor: Mutex::new(None),
                pending: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
            background: Mutex::new(JoinSet::new()),
        };
        future::ready(Ok(Box::new(context) as Box<dyn BrowsingContext>)).boxed()
    }
}

struct ScriptedContext {
    inner: Arc<ScriptedInner>,
    background: Mutex<JoinSet<()>>,
}

struct ScriptedInner {
    engine: ScriptedEngine,
    responses: Mutex<Vec<mpsc::Sender<ResponseEvent>>>,
    interceptor: Mutex<Option<mpsc::Sender<InterceptedRequest>>>,
    pending: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedInner {
    async fn play(&self, exchange: &ScriptedExchange) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SiteDumpError::Engine("Browsing context is closed".to_string()));
        }

        let interceptor = self
            .interceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let (status, headers, body) = match interceptor {
            Some(interceptor) => {
                let (request, decision) =
                    InterceptedRequest::new(&exchange.url, &exchange.method, HeaderList::new());
                interceptor
                    .send(request)
                    .await
                    .map_err(|_| SiteDumpError::Engine("Interceptor detached".to_string()))?;
                let disposition = decision.await.map_err(|_| {
                    SiteDumpError::Engine(format!("No disposition for {}", exchange.url))
                })?;

                self.engine
                    .observed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(ObservedDisposition {
                        url: exchange.url.clone(),
                        method: exchange.method.clone(),
                        disposition: disposition.clone(),
                    });

                match disposition {
                    Disposition::Continue => (
                        exchange.status,
                        exchange.headers.clone(),
                        exchange.body.clone(),
                    ),
                    Disposition::Respond(response) => (
                        response.status,
                        response.headers,
                        response.body.unwrap_or_default(),
                    ),
                    Disposition::Abort => {
                        return Err(SiteDumpError::Engine(format!(
                            "Request aborted: {}",
                            exchange.url
                        )));
                    }
                }
            }
            None => (
                exchange.status,
                exchange.headers.clone(),
                exchange.body.clone(),
            ),
        };

        let subscribers = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            let mut event = ResponseEvent::with_body(
                &exchange.url,
                &exchange.method,
                status,
                headers.clone(),
                body.clone(),
            );
            if exchange.body_fails {
                let url = exchange.url.clone();
                event.body = future::ready(Err(SiteDumpError::Engine(format!(
                    "Body no longer available for {url}"
                ))))
                .boxed();
            }
            let _ = subscriber.send(event).await;
        }

        Ok(())
    }
}

impl BrowsingContext for ScriptedContext {
    fn subscribe_responses(&self) -> Result<mpsc::Receiver<ResponseEvent>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SiteDumpError::Engine("Browsing context is closed".to_string()));
        }
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        self.inner
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(rx)
    }

    fn enable_interception(&self) -> Result<mpsc::Receiver<InterceptedRequest>> {
        let mut interceptor = self
            .inner
            .interceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if interceptor.is_some() || self.inner.closed.load(Ordering::SeqCst) {
            return Err(SiteDumpError::Engine(
                "Interception unavailable on this context".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        *interceptor = Some(tx);
        Ok(rx)
    }

    fn navigate<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let navigation_error = |reason: String| SiteDumpError::Navigation {
                url: url.to_string(),
                reason,
            };

            let exchanges = self
                .inner
                .engine
                .sites
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(url)
                .cloned()
                .ok_or_else(|| navigation_error("host unreachable".to_string()))?;

            let (late, immediate): (Vec<_>, Vec<_>) =
                exchanges.into_iter().partition(|e| e.delay.is_some());

            for (i, exchange) in immediate.iter().enumerate() {
                let played = self.inner.play(exchange).await;
                if i == 0 {
                    played.map_err(|e| navigation_error(e.to_string()))?;
                }
            }

            let mut background = self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for exchange in late {
                let inner = Arc::clone(&self.inner);
                inner.pending.fetch_add(1, Ordering::SeqCst);
                background.spawn(async move {
                    tokio::time::sleep(exchange.delay.unwrap_or_default()).await;
                    let _ = inner.play(&exchange).await;
                    inner.pending.fetch_sub(1, Ordering::SeqCst);
                });
            }

            Ok(())
        }
        .boxed()
    }

    fn pending_requests(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
        self.inner
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner
            .interceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        future::ready(Ok(())).boxed()
    }
}
