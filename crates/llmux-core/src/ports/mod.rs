//! Ports for the collaborators the client consumes but does not own.
//!
//! Implementations live in llmux-infra; core ships only the fast
//! [`hash::DefaultContentHasher`] fallback.

pub mod cache;
pub mod credential;
pub mod hash;
