//! Browsing engine interface
//!
//! The engine navigates pages and raises network events. Capture consumes
//! completed responses; replay consumes held outgoing requests and decides
//! their disposition. Two implementations ship with the crate: [`HttpEngine`]
//! fetches over plain HTTP, [`ScriptedEngine`] plays back a fixed script.

mod http;
mod links;
mod scripted;

pub use http::HttpEngine;
pub use links::{discover_subresources, resolve_reference};
pub use scripted::{ObservedDisposition, ScriptedEngine, ScriptedExchange};

use std::fmt;

use bytes::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::headers::HeaderList;
use crate::Result;

/// Capacity of per-context event queues
pub const EVENT_QUEUE_DEPTH: usize = 1024;

/// Deferred accessor for a response body
pub type BodyFuture = BoxFuture<'static, Result<Bytes>>;

/// Source of isolated browsing contexts
pub trait BrowsingEngine: Send + Sync {
    /// Create a fresh context sharing nothing with other contexts
    fn new_context(&self) -> BoxFuture<'_, Result<Box<dyn BrowsingContext>>>;
}

/// One isolated browsing context (a tab)
pub trait BrowsingContext: Send + Sync {
    /// Stream of completed responses observed by this context
    ///
    /// # Errors
    ///
    /// Returns error if the context is closed
    fn subscribe_responses(&self) -> Result<mpsc::Receiver<ResponseEvent>>;

    /// Switch to interception mode: every outgoing request is held until it
    /// is dispositioned through the returned stream
    ///
    /// # Errors
    ///
    /// Returns error if the context is closed or already intercepting
    fn enable_interception(&self) -> Result<mpsc::Receiver<InterceptedRequest>>;

    /// Navigate to an absolute URL, resolving when the primary document loads
    fn navigate<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Number of requests issued but not yet completed
    fn pending_requests(&self) -> usize {
        0
    }

    /// Close the context, ending every subscription
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// A completed network exchange
pub struct ResponseEvent {
    /// Request URL
    pub url: String,
    /// Request method
    pub method: String,
    /// Response status code
    pub status: u16,
    /// Response headers
    pub headers: HeaderList,
    /// Body, fetched only when awaited
    pub body: BodyFuture,
}

impl ResponseEvent {
    /// Event whose body is already in memory
    #[must_use]
    pub fn with_body(
        url: impl Into<String>,
        method: impl Into<String>,
        status: u16,
        headers: HeaderList,
        body: Bytes,
    ) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            status,
            headers,
            body: future::ready(Ok(body)).boxed(),
        }
    }
}

impl fmt::Debug for ResponseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseEvent")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// A response produced without contacting the origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticResponse {
    /// Status code
    pub status: u16,
    /// Headers to emit
    pub headers: HeaderList,
    /// Body; `None` means no body content
    pub body: Option<Bytes>,
}

/// Decision for a held request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Let the request reach the network unmodified
    Continue,
    /// Answer with a synthesized response
    Respond(SyntheticResponse),
    /// Fail the request
    Abort,
}

/// An outgoing request held by an intercepting context
///
/// Dispositioning consumes the request, so each one is answered at most
/// once. A request dropped without a disposition is aborted.
pub struct InterceptedRequest {
    url: String,
    method: String,
    headers: HeaderList,
    responder: Option<oneshot::Sender<Disposition>>,
}

impl InterceptedRequest {
    /// Create a held request and the receiver its engine waits on
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        method: impl Into<String>,
        headers: HeaderList,
    ) -> (Self, oneshot::Receiver<Disposition>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            url: url.into(),
            method: method.into(),
            headers,
            responder: Some(tx),
        };
        (request, rx)
    }

    /// Request URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request method
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request headers
    #[must_use]
    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    /// Let the request through unmodified
    pub fn continue_request(self) {
        self.dispose(Disposition::Continue);
    }

    /// Answer with a synthesized response
    pub fn respond(self, response: SyntheticResponse) {
        self.dispose(Disposition::Respond(response));
    }

    /// Fail the request
    pub fn abort(self) {
        self.dispose(Disposition::Abort);
    }

    /// Send `disposition` to the engine
    pub fn dispose(mut self, disposition: Disposition) {
        if let Some(responder) = self.responder.take() {
            if responder.send(disposition).is_err() {
                debug!("Engine stopped waiting for {} {}", self.method, self.url);
            }
        }
    }
}

impl Drop for InterceptedRequest {
    fn drop(&mut self) {
        if let Some(responder) = self.responder.take() {
            error!(
                "Request dropped without a disposition, aborting: {} {}",
                self.method, self.url
            );
            let _ = responder.send(Disposition::Abort);
        }
    }
}

impl fmt::Debug for InterceptedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptedRequest")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("pending", &self.responder.is_some())
            .finish_non_exhaustive()
    }
}
