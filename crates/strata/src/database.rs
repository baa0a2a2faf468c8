//! Database: a root directory of series.
//!
//! Every sub-directory holding a `series.yaml` is a series. Incoming points
//! are routed to the most specific series whose tags they carry; query
//! requests are resolved into one plan per matching series plus a manifest.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::downsample::functions::FunctionKind;
use crate::error::{Result, StrataError};
use crate::query::{ClusterKey, ColumnRequest, Query};
use crate::response::{Manifest, ManifestColumn, ManifestSeries};
use crate::schema::{tags_subset, SeriesSchema, Tags, SCHEMA_FILE_NAME};
use crate::series::{IncomingPoint, Series};

/// Column selector of a query request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilter {
    /// Tags every selected column must carry.
    pub tags: Tags,
    /// Function name evaluated per window.
    pub function: String,
}

/// A parsed query request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Tags every selected series must carry.
    pub series_tags: Tags,
    /// Column selectors; each selected column yields one output column.
    pub columns: Vec<ColumnFilter>,
    /// Range start (inclusive).
    pub start: i64,
    /// Range end (inclusive).
    pub end: i64,
    /// Window length; takes precedence over `points`.
    pub step: Option<i64>,
    /// Desired number of windows when no step is given.
    pub points: Option<usize>,
    /// Maximum number of series returned.
    pub limit: Option<usize>,
}

impl QueryRequest {
    /// Creates a request over `[start, end]` for all series.
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            series_tags: Tags::new(),
            columns: Vec::new(),
            start,
            end,
            step: None,
            points: None,
            limit: None,
        }
    }

    /// Restricts the request to series carrying `tags`.
    pub fn with_series_tags(mut self, tags: Tags) -> Self {
        self.series_tags = tags;
        self
    }

    /// Adds a column selector.
    pub fn with_column(mut self, tags: Tags, function: &str) -> Self {
        self.columns.push(ColumnFilter {
            tags,
            function: function.to_string(),
        });
        self
    }

    /// Sets the window length.
    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    /// Sets the desired number of windows.
    pub fn with_points(mut self, points: usize) -> Self {
        self.points = Some(points);
        self
    }

    /// Limits the number of series.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Effective window length.
    pub fn effective_step(&self) -> Result<i64> {
        if self.start > self.end {
            return Err(StrataError::InvalidTimeRange {
                start: self.start,
                end: self.end,
            });
        }
        let step = match (self.step, self.points) {
            (Some(step), _) => step,
            (None, Some(points)) if points > 0 => {
                let span = self.end - self.start + 1;
                (span + points as i64 - 1) / points as i64
            }
            (None, Some(_)) => return Err(StrataError::InvalidStep(0)),
            (None, None) => 1,
        };
        if step < 1 {
            return Err(StrataError::InvalidStep(step));
        }
        Ok(step)
    }
}

/// Query plan for one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesPlan {
    /// Index of the series in the manifest.
    pub manifest_index: usize,
    /// Cluster key of the read.
    pub key: ClusterKey,
    /// Output columns.
    pub columns: Vec<ColumnRequest>,
}

/// A request resolved against the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedQuery {
    /// Manifest to send ahead of the data.
    pub manifest: Manifest,
    /// One plan per manifest series.
    pub plans: Vec<SeriesPlan>,
}

/// All series under one root directory.
#[derive(Debug)]
pub struct Database {
    root: PathBuf,
    series: Vec<Series>,
}

impl Database {
    /// Opens every series under `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Configuration errors of any series are fatal.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let mut series = Vec::new();
        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            if path.is_dir() && path.join(SCHEMA_FILE_NAME).is_file() {
                series.push(Series::open(path)?);
            }
        }
        series.sort_by(|a, b| a.name().cmp(b.name()));
        info!(root = %root.display(), series = series.len(), "opened database");
        Ok(Self { root, series })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Series, sorted by name.
    pub fn series(&self) -> &[Series] {
        &self.series
    }

    /// Looks a series up by name.
    pub fn get(&self, name: &str) -> Option<&Series> {
        self.series
            .binary_search_by(|s| s.name().cmp(name))
            .ok()
            .map(|i| &self.series[i])
    }

    /// Creates a new series directory with `schema`.
    pub fn create_series(&mut self, name: &str, schema: SeriesSchema) -> Result<&Series> {
        match self.series.binary_search_by(|s| s.name().cmp(name)) {
            Ok(_) => Err(StrataError::Config(format!("series '{}' already exists", name))),
            Err(i) => {
                let series = Series::create(self.root.join(name), schema)?;
                self.series.insert(i, series);
                Ok(&self.series[i])
            }
        }
    }

    /// Picks the series for `point`: the one with the most tags among those
    /// whose tags are all carried by the point.
    pub fn route(&self, point: &IncomingPoint) -> Result<usize> {
        self.series
            .iter()
            .enumerate()
            .filter(|(_, s)| tags_subset(s.tags(), &point.tags))
            .max_by(|(ia, a), (ib, b)| a.tags().len().cmp(&b.tags().len()).then(ib.cmp(ia)))
            .map(|(i, _)| i)
            .ok_or(StrataError::NoMatchingSeries)
    }

    /// Routes and stores a point.
    pub fn insert(&mut self, point: &IncomingPoint) -> Result<()> {
        let index = self.route(point)?;
        self.series[index].insert_point(point)
    }

    /// Catches every series' coarser buckets up after a restart.
    pub fn startup(&mut self) -> Result<usize> {
        let mut rows = 0;
        for series in &mut self.series {
            rows += series.downsample_startup()?;
        }
        Ok(rows)
    }

    /// Periodic maintenance: downsample and threshold flushes. Failures are
    /// logged per series and do not stop the others.
    pub fn tick(&mut self) {
        for series in &mut self.series {
            if let Err(e) = series.flush(false) {
                error!(series = %series.name(), error = %e, "periodic flush failed");
            }
        }
    }

    /// Flushes every series, returning the number of points persisted.
    pub fn flush(&mut self, force: bool) -> Result<usize> {
        let mut points = 0;
        for series in &mut self.series {
            points += series.flush(force)?;
        }
        Ok(points)
    }

    /// Flushes all series for shutdown, continuing past failures and
    /// reporting the first one.
    pub fn close(&mut self) -> Result<()> {
        let mut first_error = None;
        for series in &mut self.series {
            if let Err(e) = series.close() {
                error!(series = %series.name(), error = %e, "flush on close failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Resolves a request into per-series plans and a manifest.
    ///
    /// # Errors
    ///
    /// Returns a request error for an invalid range or step, an unknown
    /// function, or when no series has a matching column.
    pub fn resolve(&self, request: &QueryRequest) -> Result<ResolvedQuery> {
        let step = request.effective_step()?;
        let functions: Vec<FunctionKind> = request
            .columns
            .iter()
            .map(|c| FunctionKind::from_name(&c.function))
            .collect::<Result<_>>()?;

        let mut manifest = Manifest {
            start: request.start,
            end: request.end,
            step,
            series: Vec::new(),
        };
        let mut plans = Vec::new();
        let limit = request.limit.unwrap_or(usize::MAX);
        for series in self.series.iter().filter(|s| s.matches(&request.series_tags)) {
            if plans.len() >= limit {
                break;
            }
            let mut columns = Vec::new();
            let mut described = Vec::new();
            for (filter, function) in request.columns.iter().zip(&functions) {
                for index in series.select_columns(&filter.tags) {
                    columns.push(ColumnRequest::new(index, *function));
                    described.push(ManifestColumn {
                        tags: series.columns()[index].tags.clone(),
                        function: function.name().to_string(),
                    });
                }
            }
            if columns.is_empty() {
                continue;
            }
            plans.push(SeriesPlan {
                manifest_index: manifest.series.len(),
                key: ClusterKey::new(series.name(), request.start, request.end, step),
                columns,
            });
            manifest.series.push(ManifestSeries {
                name: series.name().to_string(),
                tags: series.tags().clone(),
                columns: described,
            });
        }
        if plans.is_empty() {
            return Err(StrataError::NoMatchingSeries);
        }
        Ok(ResolvedQuery { manifest, plans })
    }

    /// Plans a query against the series named in `key`.
    pub fn query(&self, key: &ClusterKey, columns: &[ColumnRequest]) -> Result<Query> {
        let series = self.get(&key.series).ok_or(StrataError::NoMatchingSeries)?;
        series.query(columns, key.start, key.end, key.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;
    use tempfile::TempDir;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn schema(series_tags: Tags) -> SeriesSchema {
        SeriesSchema::new(
            series_tags,
            vec![1],
            vec![
                ColumnSchema::new(tags(&[("name", "cpu")])),
                ColumnSchema::new(tags(&[("name", "mem")])),
            ],
        )
    }

    #[test]
    fn test_route_prefers_most_specific_series() {
        let dir = TempDir::new().unwrap();
        let mut db = Database::open(dir.path()).unwrap();
        db.create_series("all", schema(Tags::new())).unwrap();
        db.create_series("web1", schema(tags(&[("host", "web1")]))).unwrap();
        assert!(db.create_series("web1", schema(Tags::new())).is_err());

        let point = IncomingPoint::new(10, tags(&[("host", "web1")]));
        assert_eq!(db.series()[db.route(&point).unwrap()].name(), "web1");
        let other = IncomingPoint::new(10, tags(&[("host", "db")]));
        assert_eq!(db.series()[db.route(&other).unwrap()].name(), "all");
    }

    #[test]
    fn test_reopen_finds_series() {
        let dir = TempDir::new().unwrap();
        {
            let mut db = Database::open(dir.path()).unwrap();
            db.create_series("b", schema(Tags::new())).unwrap();
            db.create_series("a", schema(Tags::new())).unwrap();
        }
        fs::create_dir(dir.path().join("not-a-series")).unwrap();
        let db = Database::open(dir.path()).unwrap();
        let names: Vec<&str> = db.series().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(db.get("b").is_some());
        assert!(db.get("c").is_none());
    }

    #[test]
    fn test_resolve_request() {
        let dir = TempDir::new().unwrap();
        let mut db = Database::open(dir.path()).unwrap();
        db.create_series("web1", schema(tags(&[("host", "web1")]))).unwrap();
        db.create_series("web2", schema(tags(&[("host", "web2")]))).unwrap();

        let request = QueryRequest::new(0, 999)
            .with_column(tags(&[("name", "cpu")]), "max")
            .with_column(Tags::new(), "count")
            .with_points(10)
            .with_limit(1);
        let resolved = db.resolve(&request).unwrap();
        assert_eq!(resolved.manifest.step, 100);
        assert_eq!(resolved.plans.len(), 1);
        let plan = &resolved.plans[0];
        assert_eq!(plan.key, ClusterKey::new("web1", 0, 999, 100));
        // cpu:max, then count over both columns.
        assert_eq!(plan.columns.len(), 3);
        assert_eq!(resolved.manifest.series[0].columns[2].function, "count");

        let none = QueryRequest::new(0, 10).with_column(tags(&[("name", "disk")]), "max");
        assert!(matches!(db.resolve(&none), Err(StrataError::NoMatchingSeries)));
        let bad = QueryRequest::new(0, 10).with_column(Tags::new(), "median");
        assert!(matches!(db.resolve(&bad), Err(StrataError::UnknownFunction(_))));
        let inverted = QueryRequest::new(10, 0).with_column(Tags::new(), "max");
        assert!(db.resolve(&inverted).unwrap_err().is_request_error());
    }

    #[test]
    fn test_insert_without_series() {
        let dir = TempDir::new().unwrap();
        let mut db = Database::open(dir.path()).unwrap();
        db.create_series("web1", schema(tags(&[("host", "web1")]))).unwrap();
        let point = IncomingPoint::new(10, tags(&[("host", "db")]));
        assert!(matches!(db.insert(&point), Err(StrataError::NoMatchingSeries)));
    }
}
