//! Series: columns, buckets and ingestion.
//!
//! A series directory holds `series.yaml` and one sub-directory per bucket,
//! named after the bucket resolution in seconds:
//!
//! ```text
//! <series>/
//!   series.yaml
//!   1/00000000000.mdb
//!   10/00000000000.mdb
//!   60/...
//! ```
//!
//! The primary bucket stores one value column per series column. Coarser
//! buckets share one layout holding, per column, every retained aggregator
//! slot.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::codec::transform::Transform;
use crate::downsample::cascade;
use crate::downsample::functions::{Aggregator, AGGREGATOR_COUNT};
use crate::error::{Result, StrataError};
use crate::query::scan::align;
use crate::query::{ColumnRequest, Query};
use crate::schema::{format_tags, tags_subset, SeriesSchema, Tags};
use crate::storage::bucket::{Bucket, BucketConfig};

/// One scalar channel of a series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Tags that identify the column.
    pub tags: Tags,
    /// Decimal exponent applied before storing.
    pub scale: i32,
    /// Transform of the column's stored values.
    pub transform: Transform,
    /// Index of the column in primary bucket rows (never 0, which is time).
    pub primary_index: usize,
    /// Index of each aggregator slot in secondary bucket rows; 0 when the
    /// slot is not retained.
    pub aggregate_index: [usize; AGGREGATOR_COUNT],
}

impl Column {
    /// Converts a field value to its stored integer.
    pub fn scale_value(&self, value: f64) -> i64 {
        (value * 10f64.powi(self.scale)).round() as i64
    }

    /// Converts a stored integer back to the field value.
    pub fn unscale_value(&self, stored: i64) -> f64 {
        stored as f64 / 10f64.powi(self.scale)
    }

    /// Returns true if the column retains aggregator `a` in coarser buckets.
    pub fn retains(&self, a: Aggregator) -> bool {
        self.aggregate_index[a.slot()] != 0
    }
}

/// Builds the column layout of a schema.
///
/// Returns the columns plus the value transforms of primary rows and of
/// secondary rows.
pub fn build_layout(
    schema: &SeriesSchema,
) -> Result<(Vec<Column>, Vec<Transform>, Vec<Transform>)> {
    let mut columns = Vec::new();
    let mut primary = Vec::new();
    let mut secondary = Vec::new();
    for def in &schema.columns {
        let transform = Transform::from_name(&def.transform)?;
        let retained = def.retained_slots()?;
        for tags in def.expanded_tags() {
            primary.push(transform);
            let mut aggregate_index = [0usize; AGGREGATOR_COUNT];
            for a in Aggregator::ALL {
                if retained[a.slot()] {
                    secondary.push(transform);
                    aggregate_index[a.slot()] = secondary.len();
                }
            }
            columns.push(Column {
                tags,
                scale: def.scale,
                transform,
                primary_index: primary.len(),
                aggregate_index,
            });
        }
    }
    Ok((columns, primary, secondary))
}

/// A point as handed over by the ingestion layer.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingPoint {
    /// Time in seconds.
    pub time: i64,
    /// Tags shared by every field.
    pub tags: Tags,
    /// Field tags and values.
    pub fields: Vec<(Tags, f64)>,
}

impl IncomingPoint {
    /// Creates a point without fields.
    pub fn new(time: i64, tags: Tags) -> Self {
        Self {
            time,
            tags,
            fields: Vec::new(),
        }
    }

    /// Adds a field.
    pub fn with_field(mut self, tags: Tags, value: f64) -> Self {
        self.fields.push((tags, value));
        self
    }
}

/// A named series with its buckets, finest first.
#[derive(Debug)]
pub struct Series {
    name: String,
    dir: PathBuf,
    schema: SeriesSchema,
    columns: Vec<Column>,
    buckets: Vec<Bucket>,
    rejected: u64,
}

impl Series {
    /// Opens the series stored in `dir` using its `series.yaml`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let schema = SeriesSchema::load(&dir)?;
        Self::open_with_schema(dir, schema)
    }

    /// Writes `schema` into `dir` and opens the series.
    pub fn create(dir: impl Into<PathBuf>, schema: SeriesSchema) -> Result<Self> {
        let dir = dir.into();
        schema.validate()?;
        schema.save(&dir)?;
        Self::open_with_schema(dir, schema)
    }

    fn open_with_schema(dir: PathBuf, schema: SeriesSchema) -> Result<Self> {
        let (columns, primary, secondary) = build_layout(&schema)?;
        let resolutions = schema.bucket_resolutions();
        let mut buckets = Vec::with_capacity(resolutions.len());
        for (i, &resolution) in resolutions.iter().enumerate() {
            let values = if i == 0 { &primary } else { &secondary };
            let mut config = BucketConfig::new(resolution, schema.points_per_file, values)
                .with_reuse_size(schema.reuse_size);
            if let Some(&next) = resolutions.get(i + 1) {
                config = config.with_next_resolution(next);
            }
            buckets.push(Bucket::open(dir.join(resolution.to_string()), config)?);
        }
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        info!(
            series = %name,
            columns = columns.len(),
            buckets = buckets.len(),
            "opened series"
        );
        Ok(Self {
            name,
            dir,
            schema,
            columns,
            buckets,
            rejected: 0,
        })
    }

    /// Series name (its directory name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Series directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Series tags.
    pub fn tags(&self) -> &Tags {
        &self.schema.tags
    }

    /// Loaded schema.
    pub fn schema(&self) -> &SeriesSchema {
        &self.schema
    }

    /// Columns in primary order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Buckets, finest first.
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Number of points rejected since open.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Returns true if `filter` is a subset of the series tags.
    pub fn matches(&self, filter: &Tags) -> bool {
        tags_subset(filter, &self.schema.tags)
    }

    /// Finds the single column whose tags are a subset of `tags`.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::UnknownColumn` when none matches and
    /// `StrataError::AmbiguousColumn` when several do.
    pub fn find_column(&self, tags: &Tags) -> Result<usize> {
        let mut found = None;
        for (i, column) in self.columns.iter().enumerate() {
            if tags_subset(&column.tags, tags) {
                if found.is_some() {
                    return Err(StrataError::AmbiguousColumn(format_tags(tags)));
                }
                found = Some(i);
            }
        }
        found.ok_or_else(|| StrataError::UnknownColumn(format_tags(tags)))
    }

    /// Columns whose tags contain every tag of `filter`.
    pub fn select_columns(&self, filter: &Tags) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| tags_subset(filter, &c.tags))
            .map(|(i, _)| i)
            .collect()
    }

    fn reject(&mut self, error: StrataError) -> StrataError {
        self.rejected += 1;
        warn!(series = %self.name, error = %error, rejected = self.rejected, "rejected point");
        error
    }

    /// Stores an incoming point in the primary bucket.
    ///
    /// The time is aligned down to the primary resolution; each field is
    /// assigned to the column its merged tags match. The whole point is
    /// rejected if any field cannot be placed.
    pub fn insert_point(&mut self, point: &IncomingPoint) -> Result<()> {
        let resolution = self.buckets[0].resolution();
        let time = align(point.time, resolution);
        let mut values = Vec::with_capacity(point.fields.len());
        for (field_tags, value) in &point.fields {
            let mut tags = point.tags.clone();
            tags.extend(field_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
            match self.find_column(&tags) {
                Ok(i) => {
                    let column = &self.columns[i];
                    values.push((column.primary_index, column.scale_value(*value)));
                }
                Err(e) => return Err(self.reject(e)),
            }
        }
        match self.buckets[0].insert(time, &values) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.reject(e)),
        }
    }

    /// Stores raw scaled values for the given columns.
    pub fn insert_values(&mut self, time: i64, values: &[(usize, i64)]) -> Result<()> {
        let mut row = Vec::with_capacity(values.len());
        for &(column, value) in values {
            let Some(c) = self.columns.get(column) else {
                return Err(self.reject(StrataError::UnknownColumn(format!(
                    "column index {}",
                    column
                ))));
            };
            row.push((c.primary_index, value));
        }
        let time = align(time, self.buckets[0].resolution());
        match self.buckets[0].insert(time, &row) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.reject(e)),
        }
    }

    /// Runs one incremental downsample pass.
    pub fn downsample(&mut self) -> Result<usize> {
        cascade::downsample(&mut self.buckets, &self.columns)
    }

    /// Replays the coarser buckets' backlog after a restart.
    pub fn downsample_startup(&mut self) -> Result<usize> {
        let rows = cascade::downsample_startup(
            &mut self.buckets,
            &self.columns,
            self.schema.force_flush_points,
        )?;
        if rows > 0 {
            info!(series = %self.name, rows, "startup downsampling complete");
        }
        Ok(rows)
    }

    /// Downsamples, then flushes buckets finest first.
    ///
    /// Without `force`, a bucket flushes once `flush_points` points are
    /// ready. Coarser buckets only flush up to their horizon.
    pub fn flush(&mut self, force: bool) -> Result<usize> {
        self.downsample()?;
        let mut flushed = 0;
        for i in 0..self.buckets.len() {
            let Some(horizon) = cascade::flush_horizon(&self.buckets, i) else {
                continue;
            };
            let ready = self.buckets[i].buffer().count_until(horizon);
            if ready > 0 && (force || ready >= self.schema.flush_points) {
                flushed += self.buckets[i].flush_until(horizon)?.points;
            }
        }
        Ok(flushed)
    }

    /// Flushes everything that can be made durable.
    pub fn close(&mut self) -> Result<()> {
        self.flush(true)?;
        Ok(())
    }

    /// Plans a query over this series.
    pub fn query(
        &self,
        requests: &[ColumnRequest],
        start: i64,
        end: i64,
        step: i64,
    ) -> Result<Query> {
        Query::plan(&self.buckets, &self.columns, requests, start, end, step)
    }
}
