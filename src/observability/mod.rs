//! Observability stack: structured logging via the tracing ecosystem.

pub mod logging;

pub use logging::{init_logging, LogFormat};
