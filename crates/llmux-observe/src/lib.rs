//! Observability setup for applications embedding llmux.
//!
//! llmux itself only emits `tracing` events; this crate installs the
//! subscriber that renders them and, optionally, exports spans through
//! OpenTelemetry.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing};
