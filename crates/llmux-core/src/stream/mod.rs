//! Streaming support: fragment accumulation and the driver that feeds it.

pub mod accumulator;
pub mod driver;

pub use accumulator::{AccumulatorState, StreamAccumulator};
pub use driver::StreamDriver;
