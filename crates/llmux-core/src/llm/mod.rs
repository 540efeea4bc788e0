//! Provider capability interface and its type-erased wrapper.

pub mod box_provider;
pub mod provider;

pub use box_provider::{BoxLlmProvider, LlmProviderDyn};
pub use provider::{ChunkStream, LlmProvider};
