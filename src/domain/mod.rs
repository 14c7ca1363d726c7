//! Domain types: readings, link states, the telemetry buffer, retry policy,
//! host integration points and settings.

pub mod backoff;
pub mod buffer;
pub mod host;
pub mod models;
pub mod settings;
