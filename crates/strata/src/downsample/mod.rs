//! Downsampling: aggregation functions and the cascade between buckets.

pub mod cascade;
pub mod functions;

pub use cascade::{downsample, downsample_startup, flush_horizon};
pub use functions::{Aggregator, FunctionKind, FunctionState, WindowAggregates, AGGREGATOR_COUNT};
