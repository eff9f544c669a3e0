//! Event loop attaching a recorder to a browsing context

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::recorder::{CaptureRecorder, CaptureSummary};
use crate::engine::{BrowsingContext, ResponseEvent};

/// Pause between idle checks while the engine still reports pending requests
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Where an attached recorder is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Subscribed, nothing being written
    Attached,
    /// Subscribed, writes in progress
    Processing {
        /// Exchanges currently being materialized
        in_flight: usize,
    },
    /// Event stream closed and every write finished
    Detached,
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    in_flight: usize,
    last_activity: Instant,
    detached: bool,
}

/// Marks one exchange as in flight for as long as it lives
struct InFlight(Arc<watch::Sender<Progress>>);

impl InFlight {
    fn begin(progress: &Arc<watch::Sender<Progress>>) -> Self {
        progress.send_modify(|p| {
            p.in_flight += 1;
            p.last_activity = Instant::now();
        });
        Self(Arc::clone(progress))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|p| {
            p.in_flight = p.in_flight.saturating_sub(1);
            p.last_activity = Instant::now();
        });
    }
}

impl CaptureRecorder {
    /// Start consuming `events`, one task per exchange
    ///
    /// The returned handle detaches once the event stream closes, which
    /// happens when the owning context is closed.
    #[must_use]
    pub fn attach(self: Arc<Self>, events: mpsc::Receiver<ResponseEvent>) -> CaptureHandle {
        let (progress, watcher) = watch::channel(Progress {
            in_flight: 0,
            last_activity: Instant::now(),
            detached: false,
        });
        let driver = tokio::spawn(drive(Arc::clone(&self), events, Arc::new(progress)));

        CaptureHandle {
            recorder: self,
            progress: watcher,
            driver,
        }
    }
}

async fn drive(
    recorder: Arc<CaptureRecorder>,
    mut events: mpsc::Receiver<ResponseEvent>,
    progress: Arc<watch::Sender<Progress>>,
) {
    let session_id = recorder.session_id();
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let in_flight = InFlight::begin(&progress);
                let recorder = Arc::clone(&recorder);
                tasks.spawn(async move {
                    let _in_flight = in_flight;
                    recorder.record(event).await;
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!("dump({}): Capture task failed: {}", session_id, e);
                }
            }
        }
    }

    debug!(
        "dump({}): Event stream closed, draining {} writes",
        session_id,
        tasks.len()
    );
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("dump({}): Capture task failed: {}", session_id, e);
        }
    }

    progress.send_modify(|p| p.detached = true);
}

/// Handle to a running capture
pub struct CaptureHandle {
    recorder: Arc<CaptureRecorder>,
    progress: watch::Receiver<Progress>,
    driver: JoinHandle<()>,
}

impl CaptureHandle {
    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> CaptureState {
        let progress = *self.progress.borrow();
        if progress.detached {
            CaptureState::Detached
        } else if progress.in_flight > 0 {
            CaptureState::Processing {
                in_flight: progress.in_flight,
            }
        } else {
            CaptureState::Attached
        }
    }

    /// Counters so far
    #[must_use]
    pub fn summary(&self) -> CaptureSummary {
        self.recorder.summary()
    }

    /// Wait until the page has gone quiet
    ///
    /// Quiet means no write in flight, no request pending in `context`, and
    /// no capture activity for `idle`. Returns `false` if `timeout` elapsed
    /// first.
    pub async fn wait_idle(
        &mut self,
        context: &dyn BrowsingContext,
        idle: Duration,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let progress = *self.progress.borrow_and_update();
            if progress.detached {
                return true;
            }

            let now = Instant::now();
            let quiet_until = progress.last_activity + idle;
            let busy = progress.in_flight > 0 || context.pending_requests() > 0;
            if !busy && now >= quiet_until {
                return true;
            }
            if now >= deadline {
                warn!(
                    "dump({}): Network did not go idle within {:?}",
                    self.recorder.session_id(),
                    timeout
                );
                return false;
            }

            let wake = if busy {
                now + IDLE_POLL_INTERVAL
            } else {
                quiet_until
            };
            let wake = wake.min(deadline);

            if let Ok(Err(_)) = tokio::time::timeout_at(wake, self.progress.changed()).await {
                // Driver is gone; nothing more will be written
                return true;
            }
        }
    }

    /// Wait for the event stream to close and every write to finish
    ///
    /// The owning context must be closed first, or this waits forever.
    pub async fn finish(self) -> CaptureSummary {
        let session_id = self.recorder.session_id();
        if let Err(e) = self.driver.await {
            error!("dump({}): Capture driver failed: {}", session_id, e);
        }
        self.recorder.summary()
    }
}
