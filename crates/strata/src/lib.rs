//! Strata - Alopex multi-resolution time series storage engine
//!
//! Each series keeps its points in a chain of buckets, finest first. The
//! primary bucket receives raw points; every coarser bucket holds per-window
//! aggregates (first, last, min, max, sum, mean) computed from the bucket
//! before it. Buckets store fixed 4096-byte blocks of packed columns in
//! time-named data files.
//!
//! # Components
//!
//! - [`codec`]: column transforms, word packing, block encoder and decoder
//! - [`storage`]: [`DataFile`], [`PointBuffer`] and [`Bucket`]
//! - [`downsample`]: aggregation functions and the downsampling cascade
//! - [`query`]: planned, chained window queries and query clustering
//! - [`Series`] / [`Database`]: schema-driven series and point routing
//! - [`Coordinator`]: a tokio task owning the database
//!
//! # Example
//!
//! ```rust,no_run
//! use alopex_strata::{ColumnSchema, Database, IncomingPoint, QueryRequest, SeriesSchema, Tags};
//!
//! # fn main() -> alopex_strata::Result<()> {
//! let mut db = Database::open("/var/lib/strata")?;
//! let mut host = Tags::new();
//! host.insert("host".into(), "web1".into());
//! let mut cpu = Tags::new();
//! cpu.insert("name".into(), "cpu".into());
//!
//! let schema = SeriesSchema::new(host.clone(), vec![1, 60], vec![ColumnSchema::new(cpu.clone())]);
//! db.create_series("web1", schema)?;
//! db.insert(&IncomingPoint::new(1_700_000_000, host).with_field(cpu, 0.75))?;
//! db.flush(true)?;
//!
//! let request = QueryRequest::new(1_700_000_000, 1_700_003_599)
//!     .with_column(Tags::new(), "mean")
//!     .with_step(60);
//! let resolved = db.resolve(&request)?;
//! let plan = &resolved.plans[0];
//! let buffer = db.query(&plan.key, &plan.columns)?.collect_all()?;
//! # let _ = buffer;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod codec;
pub mod coordinator;
pub mod database;
pub mod downsample;
pub mod error;
pub mod query;
pub mod response;
pub mod schema;
pub mod series;
pub mod storage;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle, QueryService};
pub use database::{ColumnFilter, Database, QueryRequest, ResolvedQuery, SeriesPlan};
pub use error::{Result, StrataError};
pub use query::{ClusterConfig, ClusterKey, ColumnRequest, Query, QueryBuffer, QueryClusterer};
pub use schema::{ColumnSchema, SeriesSchema, Tags};
pub use series::{Column, IncomingPoint, Series};
pub use storage::{Bucket, DataFile, PointBuffer};
