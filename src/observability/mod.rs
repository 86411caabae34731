//! Observability for the telemetry client
//!
//! Structured logging through `tracing`, configured from the environment.

pub mod logging;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, parse_level, parse_log_spans, LogFormat};

// Span macros for structured logging
pub use logging::{session_span, telemetry_span};
