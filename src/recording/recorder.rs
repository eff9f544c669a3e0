//! Turns completed network exchanges into store writes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::charset;
use crate::engine::ResponseEvent;
use crate::storage::{Exchange, RecordStore, SessionId};
use crate::{Result, SiteDumpError};

/// What happened to one completed exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Body read, charset resolved, exchange stored
    Captured,
    /// `OPTIONS` request stored with status only
    PreflightSkipped,
    /// Status outside 2xx stored with status only
    UpstreamNonSuccess,
}

/// Per-session capture counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    /// Exchanges stored with their body
    pub captured: usize,
    /// Preflight exchanges stored without body
    pub preflight: usize,
    /// Non-success exchanges stored without body
    pub non_success: usize,
    /// Exchanges dropped because of an error
    pub failed: usize,
}

impl CaptureSummary {
    /// Number of exchanges that reached the store
    #[must_use]
    pub fn stored(&self) -> usize {
        self.captured + self.preflight + self.non_success
    }
}

#[derive(Default)]
struct Counters {
    captured: AtomicUsize,
    preflight: AtomicUsize,
    non_success: AtomicUsize,
    failed: AtomicUsize,
}

/// Capture pipeline for one dump session
pub struct CaptureRecorder {
    session_id: SessionId,
    store: Arc<dyn RecordStore>,
    max_body_size: usize,
    counters: Counters,
}

impl CaptureRecorder {
    /// Create a recorder writing into `session_id`
    #[must_use]
    pub fn new(session_id: SessionId, store: Arc<dyn RecordStore>, max_body_size: usize) -> Self {
        Self {
            session_id,
            store,
            max_body_size,
            counters: Counters::default(),
        }
    }

    /// Session this recorder writes into
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Materialize one exchange and upsert it
    ///
    /// Headers are stored with line breaks removed. Preflight and non-success
    /// exchanges are stored without reading the body.
    ///
    /// # Errors
    ///
    /// Returns `ExchangeProcessing` if the body cannot be read or exceeds the
    /// size limit, and `StoreWrite` if the upsert fails
    pub async fn capture(&self, event: ResponseEvent) -> Result<CaptureOutcome> {
        let ResponseEvent {
            url,
            method,
            status,
            headers,
            body,
        } = event;
        let headers = headers.strip_line_breaks();

        if method.eq_ignore_ascii_case("OPTIONS") {
            self.store
                .upsert_exchange(Exchange {
                    session_id: self.session_id,
                    url,
                    headers,
                    body: Bytes::new(),
                    status,
                    charset: None,
                })
                .await?;
            return Ok(CaptureOutcome::PreflightSkipped);
        }

        if !(200..=299).contains(&status) {
            warn!(
                "dump({}): Upstream returned {}: {}",
                self.session_id, status, url
            );
            self.store
                .upsert_exchange(Exchange {
                    session_id: self.session_id,
                    url,
                    headers,
                    body: Bytes::new(),
                    status,
                    charset: None,
                })
                .await?;
            return Ok(CaptureOutcome::UpstreamNonSuccess);
        }

        let body = body.await.map_err(|e| SiteDumpError::ExchangeProcessing {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        if body.len() > self.max_body_size {
            let too_large = SiteDumpError::DataTooLarge {
                size: body.len(),
                limit: self.max_body_size,
            };
            return Err(SiteDumpError::ExchangeProcessing {
                url,
                reason: too_large.to_string(),
            });
        }

        let charset = charset::resolve(headers.content_type(), &body);

        self.store
            .upsert_exchange(Exchange {
                session_id: self.session_id,
                url,
                headers,
                body,
                status,
                charset,
            })
            .await?;

        Ok(CaptureOutcome::Captured)
    }

    /// Capture one exchange, logging and counting instead of failing
    pub async fn record(&self, event: ResponseEvent) {
        let url = event.url.clone();
        let status = event.status;

        match self.capture(event).await {
            Ok(CaptureOutcome::Captured) => {
                self.counters.captured.fetch_add(1, Ordering::Relaxed);
                debug!("dump({}): Saved({}): {}", self.session_id, status, url);
            }
            Ok(CaptureOutcome::PreflightSkipped) => {
                self.counters.preflight.fetch_add(1, Ordering::Relaxed);
                debug!("dump({}): Preflight({}): {}", self.session_id, status, url);
            }
            Ok(CaptureOutcome::UpstreamNonSuccess) => {
                self.counters.non_success.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("dump({}): Dropped {}: {}", self.session_id, url, e);
            }
        }
    }

    /// Counters so far
    #[must_use]
    pub fn summary(&self) -> CaptureSummary {
        CaptureSummary {
            captured: self.counters.captured.load(Ordering::Relaxed),
            preflight: self.counters.preflight.load(Ordering::Relaxed),
            non_success: self.counters.non_success.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
