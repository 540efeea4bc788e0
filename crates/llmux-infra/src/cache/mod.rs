pub mod memory;

pub use memory::{CacheStats, MemoryResponseCache};
