//! ebb-relay - remote authority for ebb devices
//!
//! Holds the per-scope change log and latest-state table, serves push and
//! pull over HTTP, and collects change-log entries every device has seen.

pub mod auth;
pub mod authority;
pub mod config;
pub mod error;
pub mod gc;
pub mod rate_limit;
pub mod routes;

pub use authority::{Authority, GcReport};
pub use config::AppConfig;
pub use routes::{app_router, AppState};
