//! HTTP(S) browsing engine
//!
//! Navigation fetches the primary document, following redirects, then
//! fetches the subresources it references statically in the background.
//! Every redirect hop is announced as its own response. No scripts are
//! executed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http_body_util::{BodyExt, Full, Limited};
use hyper::{Method, Request, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{
    discover_subresources, resolve_reference, BrowsingContext, BrowsingEngine, Disposition,
    InterceptedRequest, ResponseEvent, EVENT_QUEUE_DEPTH,
};
use crate::charset;
use crate::config::EngineConfig;
use crate::headers::HeaderList;
use crate::{Result, SiteDumpError};

type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Browsing engine backed by a pooled hyper client
pub struct HttpEngine {
    client: HttpClient,
    config: EngineConfig,
    max_response_size: usize,
}

impl HttpEngine {
    /// Create an engine; every context shares the connection pool
    ///
    /// `https` URLs are verified against the bundled webpki roots.
    #[must_use]
    pub fn new(config: EngineConfig, max_response_size: usize) -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build(connector);

        Self {
            client,
            config,
            max_response_size,
        }
    }
}

impl BrowsingEngine for HttpEngine {
    fn new_context(&self) -> BoxFuture<'_, Result<Box<dyn BrowsingContext>>> {
        let context = HttpContext {
            inner: Arc::new(ContextInner {
                client: self.client.clone(),
                config: self.config.clone(),
                max_response_size: self.max_response_size,
                responses: Mutex::new(Vec::new()),
                interceptor: Mutex::new(None),
                pending: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
            background: Mutex::new(JoinSet::new()),
        };
        async move { Ok(Box::new(context) as Box<dyn BrowsingContext>) }.boxed()
    }
}

struct HttpContext {
    inner: Arc<ContextInner>,
    background: Mutex<JoinSet<()>>,
}

struct ContextInner {
    client: HttpClient,
    config: EngineConfig,
    max_response_size: usize,
    responses: Mutex<Vec<mpsc::Sender<ResponseEvent>>>,
    interceptor: Mutex<Option<mpsc::Sender<InterceptedRequest>>>,
    pending: AtomicUsize,
    closed: AtomicBool,
}

/// A fetched (or synthesized) response
struct Fetched {
    status: u16,
    headers: HeaderList,
    body: Bytes,
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ContextInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SiteDumpError::Engine("Browsing context is closed".to_string()));
        }
        Ok(())
    }

    /// Fetch `url` the way the page would: through the interceptor if one is
    /// installed, then announce the completed response
    async fn load(&self, url: &str) -> Result<Fetched> {
        self.ensure_open()?;
        let _pending = PendingGuard::new(&self.pending);

        let interceptor = self
            .interceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let fetched = match interceptor {
            Some(interceptor) => {
                let (request, decision) = InterceptedRequest::new(url, "GET", HeaderList::new());
                interceptor
                    .send(request)
                    .await
                    .map_err(|_| SiteDumpError::Engine("Interceptor detached".to_string()))?;
                let disposition = decision
                    .await
                    .map_err(|_| SiteDumpError::Engine(format!("No disposition for {url}")))?;

                match disposition {
                    Disposition::Continue => self.fetch(url).await?,
                    Disposition::Respond(response) => Fetched {
                        status: response.status,
                        headers: response.headers,
                        body: response.body.unwrap_or_default(),
                    },
                    Disposition::Abort => {
                        return Err(SiteDumpError::Engine(format!("Request aborted: {url}")));
                    }
                }
            }
            None => self.fetch(url).await?,
        };

        self.announce(url, &fetched).await;
        Ok(fetched)
    }

    /// Load `url` and every redirect hop after it
    ///
    /// Returns the URL that produced the final response.
    async fn follow(&self, url: &str) -> Result<(String, Fetched)> {
        let mut current = url.to_string();
        let mut hops = 0;

        loop {
            let fetched = self.load(&current).await?;
            let Some(target) = redirect_target(&current, &fetched) else {
                return Ok((current, fetched));
            };

            if hops >= self.config.max_redirects {
                return Err(SiteDumpError::Engine(format!("Too many redirects from {url}")));
            }
            hops += 1;
            debug!("Redirect {} {} -> {}", fetched.status, current, target);
            current = target;
        }
    }

    /// Perform the request against the network
    async fn fetch(&self, url: &str) -> Result<Fetched> {
        let uri = url
            .parse::<Uri>()
            .map_err(|e| SiteDumpError::Engine(format!("Invalid URI '{url}': {e}")))?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(hyper::header::USER_AGENT, self.config.user_agent.as_str())
            .body(Full::new(Bytes::new()))
            .map_err(|e| SiteDumpError::Engine(format!("Failed to build request: {e}")))?;

        debug!("Fetching {}", url);

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let response = tokio::time::timeout(timeout, self.client.request(request))
            .await
            .map_err(|_| SiteDumpError::Engine(format!("Request timed out: {url}")))?
            .map_err(|e| SiteDumpError::Engine(format!("Request failed: {e}")))?;

        let status = response.status().as_u16();
        let headers: HeaderList = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect::<Vec<_>>()
            .into();

        let body = Limited::new(response.into_body(), self.max_response_size)
            .collect()
            .await
            .map_err(|e| SiteDumpError::Engine(format!("Failed to read response body: {e}")))?
            .to_bytes();

        Ok(Fetched {
            status,
            headers,
            body,
        })
    }

    async fn announce(&self, url: &str, fetched: &Fetched) {
        let subscribers = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for subscriber in subscribers {
            let event = ResponseEvent::with_body(
                url,
                "GET",
                fetched.status,
                fetched.headers.clone(),
                fetched.body.clone(),
            );
            if subscriber.send(event).await.is_err() {
                debug!("Response subscriber gone, dropping event for {}", url);
            }
        }
    }
}

/// Absolute `Location` of a redirect response
fn redirect_target(url: &str, fetched: &Fetched) -> Option<String> {
    if !matches!(fetched.status, 301 | 302 | 303 | 307 | 308) {
        return None;
    }
    resolve_reference(url, fetched.headers.get("location")?.trim())
}

impl BrowsingContext for HttpContext {
    fn subscribe_responses(&self) -> Result<mpsc::Receiver<ResponseEvent>> {
        self.inner.ensure_open()?;
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        self.inner
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(rx)
    }

    fn enable_interception(&self) -> Result<mpsc::Receiver<InterceptedRequest>> {
        self.inner.ensure_open()?;
        let mut interceptor = self
            .inner
            .interceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if interceptor.is_some() {
            return Err(SiteDumpError::Engine("Interception already enabled".to_string()));
        }
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        *interceptor = Some(tx);
        Ok(rx)
    }

    fn navigate<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let (document_url, document) = self
                .inner
                .follow(url)
                .await
                .map_err(|e| SiteDumpError::Navigation {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

            if !charset::is_html(document.headers.content_type()) {
                return Ok(());
            }

            let subresources = discover_subresources(
                &document_url,
                &document.body,
                self.inner.config.max_subresources,
            );
            debug!("{} references {} subresources", document_url, subresources.len());

            let mut background = self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for subresource in subresources {
                let inner = Arc::clone(&self.inner);
                inner.pending.fetch_add(1, Ordering::SeqCst);
                background.spawn(async move {
                    if let Err(e) = inner.follow(&subresource).await {
                        warn!("Subresource {} failed: {}", subresource, e);
                    }
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
        async { Ok(()) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyntheticResponse;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn engine() -> HttpEngine {
        HttpEngine::new(EngineConfig::default(), 1024)
    }

    fn response(status: u16, location: Option<&str>) -> Fetched {
        let mut headers = HeaderList::new();
        if let Some(location) = location {
            headers.push("Location", location);
        }
        Fetched {
            status,
            headers,
            body: Bytes::new(),
        }
    }

    #[test]
    fn test_redirect_target() {
        let base = "http://a.test/dir/page";
        assert_eq!(
            redirect_target(base, &response(301, Some("/home"))).as_deref(),
            Some("http://a.test/home")
        );
        assert_eq!(
            redirect_target(base, &response(307, Some("next"))).as_deref(),
            Some("http://a.test/dir/next")
        );
        assert_eq!(
            redirect_target(base, &response(302, Some("https://b.test/"))).as_deref(),
            Some("https://b.test/")
        );
        assert_eq!(redirect_target(base, &response(301, None)), None);
        assert_eq!(redirect_target(base, &response(304, Some("/home"))), None);
        assert_eq!(redirect_target(base, &response(200, Some("/home"))), None);
    }

    #[tokio::test]
    async fn test_https_opens_a_tls_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut first = [0u8; 1];
            stream.read_exact(&mut first).await.unwrap();
            first[0]
        });

        let context = engine().new_context().await.unwrap();
        let result = context.navigate(&format!("https://{addr}/")).await;

        // 0x16 is the TLS handshake record type
        assert_eq!(server.await.unwrap(), 0x16);
        assert!(matches!(result, Err(SiteDumpError::Navigation { .. })));
    }

    #[tokio::test]
    async fn test_context_rejects_second_interceptor() {
        let context = engine().new_context().await.unwrap();
        let _requests = context.enable_interception().unwrap();
        assert!(context.enable_interception().is_err());
    }

    #[tokio::test]
    async fn test_closed_context_rejects_use() {
        let context = engine().new_context().await.unwrap();
        context.close().await.unwrap();

        assert!(context.subscribe_responses().is_err());
        assert!(context.navigate("http://127.0.0.1:9/").await.is_err());
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let context = engine().new_context().await.unwrap();
        let mut responses = context.subscribe_responses().unwrap();
        context.close().await.unwrap();

        assert!(responses.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_intercepted_navigation_uses_synthesized_document() {
        let context = engine().new_context().await.unwrap();
        let mut requests = context.enable_interception().unwrap();
        let mut responses = context.subscribe_responses().unwrap();

        let responder = tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            assert_eq!(request.url(), "http://offline.invalid/");
            request.respond(SyntheticResponse {
                status: 200,
                headers: [("Content-Type", "text/plain")].into_iter().collect(),
                body: Some(Bytes::from_static(b"offline")),
            });
        });

        context.navigate("http://offline.invalid/").await.unwrap();
        responder.await.unwrap();

        let event = responses.recv().await.unwrap();
        assert_eq!(event.status, 200);
        assert_eq!(event.body.await.unwrap(), Bytes::from_static(b"offline"));
        assert_eq!(context.pending_requests(), 0);
    }
}
