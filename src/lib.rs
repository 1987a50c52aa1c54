//! mediagate library
//!
//! Admission control in front of a media extraction worker: per-client
//! rate limiting, daily byte quotas, and an expiring registry of
//! downloaded artifacts, served over HTTP.

pub mod admission;
pub mod cli;
pub mod clock;
pub mod config;
pub mod limits;
pub mod logging;
pub mod media;
pub mod server;
pub mod sweep;
