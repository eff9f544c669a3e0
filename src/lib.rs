//! Sitedump - capture a live site's network traffic and replay it offline
//!
//! A dump session records every completed exchange a browsing context
//! observes; a show session intercepts outgoing requests and answers them
//! from the stored exchanges without contacting the origin.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod charset;
pub mod config;
pub mod engine;
pub mod error;
pub mod headers;
pub mod recording;
pub mod replay;
pub mod server;
pub mod session;
pub mod storage;

pub use error::{Result, SiteDumpError};
