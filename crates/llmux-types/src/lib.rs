//! Shared domain types for llmux.
//!
//! This crate contains the plain data shapes used across the llmux client:
//! canonical chat requests/responses and stream fragments, the error
//! taxonomy, client events, configuration and health reports.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod llm;
