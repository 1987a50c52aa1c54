//! Server module
//!
//! HTTP surface, rate-limit middleware and startup/shutdown plumbing.

pub mod http;
pub mod ratelimit;
pub mod startup;

pub use http::{create_router, AppState, HttpConfig};
pub use startup::{run_server_with_config, ServerConfig, ServerHandle};
