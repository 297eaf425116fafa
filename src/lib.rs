#[macro_use]
extern crate tracing;

#[macro_use]
pub mod internal_events;

pub mod app;
pub mod broker;
pub mod cli;
pub mod config;
pub mod controller;
pub mod event;
pub mod gate;
pub mod http;
pub mod metrics;
pub mod retries;
pub mod router;
pub mod shutdown;
pub mod signal;
pub mod store;

/// Floodgate's basic error type, dynamically dispatched and safe to send
/// across threads.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Floodgate's basic result type, defined in terms of [`Error`] and generic
/// over `T`.
pub type Result<T> = std::result::Result<T, Error>;

pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
