//! Request routing for the control surface

use std::sync::Arc;

use bytes::Bytes;
use chrono::FixedOffset;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, EXPIRES, LOCATION, PRAGMA};
use hyper::{Method, Request, Response, StatusCode};
use tracing::{debug, warn};

use super::pages;
use crate::session::SessionController;
use crate::storage::SessionId;
use crate::{Result, SiteDumpError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Dispatches control-surface requests to the session controller
#[derive(Clone)]
pub struct Router {
    controller: Arc<SessionController>,
    max_request_size: usize,
    display_offset: FixedOffset,
}

impl Router {
    /// Create a router with request bodies bounded by `max_request_size`
    #[must_use]
    pub fn new(
        controller: Arc<SessionController>,
        max_request_size: usize,
        display_offset: FixedOffset,
    ) -> Self {
        Self {
            controller,
            max_request_size,
            display_offset,
        }
    }

    /// Handle one request
    pub async fn handle<B>(&self, request: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        debug!("{} {}", method, path);

        let result = match (&method, path.as_str()) {
            (&Method::GET, "/") => self.index().await,
            (&Method::GET, "/sessions") => self.sessions().await,
            (&Method::POST, "/dump") => self.dump(request.into_body()).await,
            (&Method::GET, _) if path.starts_with("/show/") => {
                self.show(&path["/show/".len()..]).await
            }
            _ => Ok(text_response(StatusCode::NOT_FOUND, "Not found")),
        };

        result.unwrap_or_else(|e| error_response(&e))
    }

    async fn index(&self) -> Result<Response<Full<Bytes>>> {
        let sessions = self.controller.list_sessions().await?;
        let html = pages::index(
            &sessions,
            &self.controller.active_shows(),
            self.display_offset,
        );

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .header(PRAGMA, "no-cache")
            .header(EXPIRES, "0")
            .body(Full::new(Bytes::from(html)))
            .expect("Failed to build response"))
    }

    async fn sessions(&self) -> Result<Response<Full<Bytes>>> {
        let sessions = self.controller.list_sessions().await?;
        let json = serde_json::to_vec(&sessions)
            .map_err(|e| SiteDumpError::Other(format!("Failed to encode sessions: {e}")))?;

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .header(CACHE_CONTROL, "no-cache")
            .body(Full::new(Bytes::from(json)))
            .expect("Failed to build response"))
    }

    async fn dump<B>(&self, body: B) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let limit = self.max_request_size;
        let announced = usize::try_from(body.size_hint().lower()).unwrap_or(usize::MAX);
        if announced > limit {
            return Err(SiteDumpError::DataTooLarge {
                size: announced,
                limit,
            });
        }

        let body = Limited::new(body, limit)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<LengthLimitError>() {
                    // Streamed body; the exact size is never read
                    SiteDumpError::DataTooLarge {
                        size: limit.saturating_add(1),
                        limit,
                    }
                } else {
                    SiteDumpError::Other(format!("Failed to read request body: {e}"))
                }
            })?
            .to_bytes();

        let url = form_field(&body, "url").ok_or_else(|| SiteDumpError::InvalidUrl {
            url: String::new(),
            reason: "missing url field".to_string(),
        })?;

        self.controller.dump(&url).await?;
        Ok(redirect("/"))
    }

    async fn show(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        let Ok(session_id) = id.parse::<SessionId>() else {
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                &format!("Invalid session id: {id}"),
            ));
        };

        self.controller.show(session_id).await?;
        Ok(redirect("/"))
    }
}

/// Value of `name` in an `application/x-www-form-urlencoded` body
#[must_use]
pub fn form_field(body: &[u8], name: &str) -> Option<String> {
    let body = String::from_utf8_lossy(body);
    body.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            let spaced = s.replace('+', " ");
            urlencoding::decode(&spaced).map(std::borrow::Cow::into_owned).ok()
        };
        (decode(key)? == name).then(|| decode(value)).flatten()
    })
}

/// Create a plain-text response
///
/// # Panics
///
/// Panics if response builder fails (should never happen with valid inputs)
#[must_use]
pub fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("Failed to build response")
}

/// Create a `302 Found` pointing at `location`
///
/// # Panics
///
/// Panics if response builder fails (should never happen with valid inputs)
#[must_use]
pub fn redirect(location: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .body(Full::new(Bytes::new()))
        .expect("Failed to build response")
}

/// Map an error to a status code with a plain-text body
#[must_use]
pub fn error_response(error: &SiteDumpError) -> Response<Full<Bytes>> {
    let status = match error {
        SiteDumpError::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
        SiteDumpError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        SiteDumpError::DataTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!("Request failed: {}", error);
    }

    text_response(status, &format!("Error: {error}"))
}
