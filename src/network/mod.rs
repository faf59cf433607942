//! TCP transport and outbound throttling

pub mod connection;
pub mod rate_limit;

pub use connection::{accept_cancellable, configure_stream, connect, listen};
pub use rate_limit::RateLimiter;
