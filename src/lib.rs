pub mod auth;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod messages;
pub mod models;
pub mod users;

use tracing_subscriber::EnvFilter;

/// Initialize tracing the same way in every binary: `RUST_LOG` wins,
/// otherwise the given default filter; JSON output in production.
pub fn init_tracing(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.parse().expect("default filter is valid"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
