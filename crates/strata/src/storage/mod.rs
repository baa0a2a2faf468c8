//! On-disk storage: data files, the point buffer and resolution buckets.

pub mod bucket;
pub mod buffer;
pub mod data_file;

pub use bucket::{Bucket, BucketConfig, BucketSnapshot, FlushStats};
pub use buffer::PointBuffer;
pub use data_file::DataFile;
