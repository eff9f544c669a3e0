//! Capture pipeline for dump sessions
//!
//! A [`CaptureRecorder`] turns completed exchanges into store writes. Once
//! attached to a context's response stream it processes each exchange on
//! its own task, and the returned [`CaptureHandle`] provides the idle
//! barrier and the final drain.

mod handle;
mod recorder;

pub use handle::{CaptureHandle, CaptureState};
pub use recorder::{CaptureOutcome, CaptureRecorder, CaptureSummary};
