//! Core orchestration for llmux.
//!
//! - [`pipeline`]: ordered middleware with request, response and error phases
//! - [`registry`]: provider lookup, per-provider circuit breaking and health
//! - [`client`]: the request executor (cache, dedup, retry/fallback, batch)
//! - [`stream`]: accumulation of streamed fragments into a final response
//!
//! Collaborators (cache backends, credential stores, hashers, provider
//! adapters) plug in through the traits in [`ports`] and [`llm`]; the
//! concrete implementations live in llmux-infra.

pub mod client;
pub mod event;
pub mod llm;
pub mod pipeline;
pub mod ports;
pub mod registry;
pub mod stream;

#[cfg(test)]
mod testing;

pub use client::{ChatOptions, LlmClient, LlmClientBuilder};
