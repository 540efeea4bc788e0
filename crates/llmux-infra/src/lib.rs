//! Infrastructure layer for llmux.
//!
//! Concrete implementations of the ports defined in `llmux-core`: the
//! in-memory response cache, SHA-256 cache-key hashing, credential
//! backends, the TOML configuration loader and the OpenAI-compatible
//! HTTP adapter behind the built-in providers.

pub mod cache;
pub mod client;
pub mod config;
pub mod crypto;
pub mod llm;
pub mod secret;

pub use client::{DefaultClient, build_default_client};
