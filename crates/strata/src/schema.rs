//! Series schema file (`series.yaml`).
//!
//! ```yaml
//! tags: {host: web1}
//! resolutions: [1, 10, 6]
//! points_per_file: 8640
//! columns:
//!   - tags: {name: cpu}
//!     scale: 2
//!     transform: delta
//!     aggregations: [mean, max, difference]
//!     duplicate: [{core: "0"}, {core: "1"}]
//! ```
//!
//! `resolutions` starts with the primary resolution in seconds; every later
//! entry is a factor relative to the previous bucket.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::block::MAX_BLOCK_COLUMNS;
use crate::codec::transform::Transform;
use crate::downsample::functions::{FunctionKind, SlotMask, AGGREGATOR_COUNT};
use crate::error::{Result, StrataError};

/// Name of the schema file inside a series directory.
pub const SCHEMA_FILE_NAME: &str = "series.yaml";

/// Default points per data file.
pub const DEFAULT_POINTS_PER_FILE: i64 = 8640;

/// Default buffered point count that triggers a flush.
pub const DEFAULT_FLUSH_POINTS: usize = 256;

/// Default point count that forces a flush during startup catch-up.
pub const DEFAULT_FORCE_FLUSH_POINTS: usize = 4096;

/// Default reuse threshold for the last block, in bytes.
pub const DEFAULT_REUSE_SIZE: usize = 2048;

/// Key/value labels.
pub type Tags = BTreeMap<String, String>;

/// Returns true if every tag of `subset` is present in `set` with the same
/// value.
pub fn tags_subset(subset: &Tags, set: &Tags) -> bool {
    subset.iter().all(|(k, v)| set.get(k) == Some(v))
}

/// Renders tags as `{k=v,...}` for messages.
pub fn format_tags(tags: &Tags) -> String {
    let inner: Vec<String> = tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{{{}}}", inner.join(","))
}

fn default_points_per_file() -> i64 {
    DEFAULT_POINTS_PER_FILE
}

fn default_flush_points() -> usize {
    DEFAULT_FLUSH_POINTS
}

fn default_force_flush_points() -> usize {
    DEFAULT_FORCE_FLUSH_POINTS
}

fn default_reuse_size() -> usize {
    DEFAULT_REUSE_SIZE
}

fn default_transform() -> String {
    Transform::DELTA.name().to_string()
}

/// One column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Tags matched against incoming values.
    #[serde(default)]
    pub tags: Tags,
    /// Decimal exponent: values are stored as `round(v * 10^scale)`.
    #[serde(default)]
    pub scale: i32,
    /// Transform name.
    #[serde(default = "default_transform")]
    pub transform: String,
    /// Aggregations retained in coarser buckets; empty retains all.
    #[serde(default)]
    pub aggregations: Vec<String>,
    /// Extra tag sets, each producing a copy of this column.
    #[serde(default)]
    pub duplicate: Vec<Tags>,
}

impl ColumnSchema {
    /// Creates a column matching `tags` with default settings.
    pub fn new(tags: Tags) -> Self {
        Self {
            tags,
            scale: 0,
            transform: default_transform(),
            aggregations: Vec::new(),
            duplicate: Vec::new(),
        }
    }

    /// Sets the decimal scale.
    pub fn with_scale(mut self, scale: i32) -> Self {
        self.scale = scale;
        self
    }

    /// Sets the retained aggregations.
    pub fn with_aggregations(mut self, names: &[&str]) -> Self {
        self.aggregations = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Tag sets of the columns this definition expands to.
    pub fn expanded_tags(&self) -> Vec<Tags> {
        if self.duplicate.is_empty() {
            return vec![self.tags.clone()];
        }
        self.duplicate
            .iter()
            .map(|extra| {
                let mut tags = self.tags.clone();
                tags.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
                tags
            })
            .collect()
    }

    /// Parsed aggregation functions.
    pub fn functions(&self) -> Result<Vec<FunctionKind>> {
        self.aggregations
            .iter()
            .map(|name| {
                FunctionKind::from_name(name).map_err(|_| {
                    StrataError::Config(format!("unknown aggregation '{}'", name))
                })
            })
            .collect()
    }

    /// Aggregator slots kept in coarser buckets for each expanded column.
    pub fn retained_slots(&self) -> Result<SlotMask> {
        let functions = self.functions()?;
        let mut retained = [functions.is_empty(); AGGREGATOR_COUNT];
        for function in &functions {
            function.needs(&mut retained);
        }
        Ok(retained)
    }
}

/// Contents of a `series.yaml` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesSchema {
    /// Series tags; a point is routed here when these are a subset of its tags.
    #[serde(default)]
    pub tags: Tags,
    /// Primary resolution in seconds, then factors of each coarser bucket.
    pub resolutions: Vec<i64>,
    /// Points per data file.
    #[serde(default = "default_points_per_file")]
    pub points_per_file: i64,
    /// Buffered points that trigger a normal flush.
    #[serde(default = "default_flush_points")]
    pub flush_points: usize,
    /// Buffered points that force a flush during startup catch-up.
    #[serde(default = "default_force_flush_points")]
    pub force_flush_points: usize,
    /// The last block is rewritten while its used bytes stay below this.
    #[serde(default = "default_reuse_size")]
    pub reuse_size: usize,
    /// Column definitions.
    pub columns: Vec<ColumnSchema>,
}

impl SeriesSchema {
    /// Creates a schema with default thresholds.
    pub fn new(tags: Tags, resolutions: Vec<i64>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            tags,
            resolutions,
            points_per_file: DEFAULT_POINTS_PER_FILE,
            flush_points: DEFAULT_FLUSH_POINTS,
            force_flush_points: DEFAULT_FORCE_FLUSH_POINTS,
            reuse_size: DEFAULT_REUSE_SIZE,
            columns,
        }
    }

    /// Sets the points per data file.
    pub fn with_points_per_file(mut self, points: i64) -> Self {
        self.points_per_file = points;
        self
    }

    /// Sets the flush threshold.
    pub fn with_flush_points(mut self, points: usize) -> Self {
        self.flush_points = points;
        self
    }

    /// Sets the startup force-flush threshold.
    pub fn with_force_flush_points(mut self, points: usize) -> Self {
        self.force_flush_points = points;
        self
    }

    /// Sets the reuse threshold.
    pub fn with_reuse_size(mut self, bytes: usize) -> Self {
        self.reuse_size = bytes;
        self
    }

    /// Parses and validates a schema.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let schema: Self = serde_yaml::from_str(text)?;
        schema.validate()?;
        Ok(schema)
    }

    /// Serializes the schema.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Loads `series.yaml` from a series directory.
    pub fn load(dir: &Path) -> Result<Self> {
        Self::from_yaml(&fs::read_to_string(dir.join(SCHEMA_FILE_NAME))?)
    }

    /// Writes `series.yaml` into a series directory.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(SCHEMA_FILE_NAME), self.to_yaml()?)?;
        Ok(())
    }

    /// Checks the schema for configuration errors.
    pub fn validate(&self) -> Result<()> {
        let Some((&primary, factors)) = self.resolutions.split_first() else {
            return Err(StrataError::Config("at least one resolution required".into()));
        };
        if primary < 1 {
            return Err(StrataError::Config(format!(
                "primary resolution {} must be at least 1",
                primary
            )));
        }
        if let Some(bad) = factors.iter().find(|&&f| f < 2) {
            return Err(StrataError::Config(format!(
                "bucket factor {} must be at least 2",
                bad
            )));
        }
        if self.points_per_file < 1 {
            return Err(StrataError::Config(format!(
                "points_per_file {} must be at least 1",
                self.points_per_file
            )));
        }
        if self.columns.is_empty() {
            return Err(StrataError::Config("no columns defined".into()));
        }

        let mut expanded: Vec<Tags> = Vec::new();
        let mut secondary_width = 1;
        for column in &self.columns {
            Transform::from_name(&column.transform)?;
            let retained = column.retained_slots()?;
            for tags in column.expanded_tags() {
                if let Some(other) = expanded
                    .iter()
                    .find(|o| tags_subset(o, &tags) || tags_subset(&tags, o))
                {
                    let problem = if *other == tags { "duplicate" } else { "ambiguous" };
                    return Err(StrataError::Config(format!(
                        "{} columns {} and {}",
                        problem,
                        format_tags(other),
                        format_tags(&tags)
                    )));
                }
                secondary_width += retained.iter().filter(|&&r| r).count();
                expanded.push(tags);
            }
        }

        let primary_width = 1 + expanded.len();
        let widest = if self.resolutions.len() > 1 {
            primary_width.max(secondary_width)
        } else {
            primary_width
        };
        if widest > MAX_BLOCK_COLUMNS {
            return Err(StrataError::Config(format!(
                "buckets need {} block columns, at most {} fit",
                widest, MAX_BLOCK_COLUMNS
            )));
        }
        Ok(())
    }

    /// Absolute resolution of every bucket, finest first.
    pub fn bucket_resolutions(&self) -> Vec<i64> {
        self.resolutions
            .iter()
            .scan(1i64, |acc, &r| {
                *acc = acc.saturating_mul(r);
                Some(*acc)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
tags: {host: web1}
resolutions: [1, 10, 6]
points_per_file: 100
columns:
  - tags: {name: cpu}
    scale: 2
    transform: delta
    aggregations: [mean, max, difference]
    duplicate: [{core: "0"}, {core: "1"}]
  - tags: {name: mem}
"#;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_with_defaults() {
        let schema = SeriesSchema::from_yaml(YAML).unwrap();
        assert_eq!(schema.tags, tags(&[("host", "web1")]));
        assert_eq!(schema.bucket_resolutions(), vec![1, 10, 60]);
        assert_eq!(schema.points_per_file, 100);
        assert_eq!(schema.flush_points, DEFAULT_FLUSH_POINTS);
        assert_eq!(schema.reuse_size, DEFAULT_REUSE_SIZE);
        assert_eq!(schema.columns[1].transform, "delta");
        assert_eq!(
            schema.columns[0].expanded_tags(),
            vec![
                tags(&[("name", "cpu"), ("core", "0")]),
                tags(&[("name", "cpu"), ("core", "1")])
            ]
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let schema = SeriesSchema::from_yaml(YAML).unwrap();
        schema.save(dir.path()).unwrap();
        assert_eq!(SeriesSchema::load(dir.path()).unwrap(), schema);
    }

    #[test]
    fn test_invalid_schemas() {
        let cases = [
            "resolutions: []\ncolumns: [{tags: {a: b}}]",
            "resolutions: [0]\ncolumns: [{tags: {a: b}}]",
            "resolutions: [1, 1]\ncolumns: [{tags: {a: b}}]",
            "resolutions: [1]\ncolumns: []",
            "resolutions: [1]\npoints_per_file: 0\ncolumns: [{tags: {a: b}}]",
            "resolutions: [1]\ncolumns: [{tags: {a: b}, transform: gorilla}]",
            "resolutions: [1]\ncolumns: [{tags: {a: b}, aggregations: [median]}]",
            "resolutions: [1]\ncolumns: [{tags: {a: b}}, {tags: {a: b}}]",
            "resolutions: [1]\ncolumns: [{tags: {a: b}, duplicate: [{c: d}, {c: d}]}]",
            "resolutions: [1]\ncolumns: [{tags: {a: b}}, {tags: {a: b, c: d}}]",
            "resolutions: [1]\ncolumns: [{tags: {a: b, c: d}}, {tags: {c: d}}]",
            "resolutions: [1]\ncolumns: [{tags: {}}, {tags: {a: b}}]",
        ];
        for case in cases {
            assert!(
                matches!(SeriesSchema::from_yaml(case), Err(StrataError::Config(_))),
                "accepted: {}",
                case
            );
        }
        assert!(matches!(
            SeriesSchema::from_yaml("resolutions: [1"),
            Err(StrataError::Yaml(_))
        ));
    }

    fn wide_schema(columns: usize, resolutions: Vec<i64>, aggregations: &[&str]) -> SeriesSchema {
        let columns = (0..columns)
            .map(|i| {
                let name = format!("c{}", i);
                ColumnSchema::new(tags(&[("name", name.as_str())])).with_aggregations(aggregations)
            })
            .collect();
        SeriesSchema::new(Tags::new(), resolutions, columns)
    }

    #[test]
    fn test_block_width_limit() {
        // Every column keeps six aggregate slots in the secondary bucket.
        assert!(wide_schema(42, vec![1, 10], &[]).validate().is_ok());
        assert!(matches!(
            wide_schema(43, vec![1, 10], &[]).validate(),
            Err(StrataError::Config(_))
        ));
        assert!(wide_schema(50, vec![1, 10], &["max"]).validate().is_ok());
        assert!(wide_schema(254, vec![1], &[]).validate().is_ok());
        assert!(matches!(
            wide_schema(255, vec![1], &[]).validate(),
            Err(StrataError::Config(_))
        ));
    }

    #[test]
    fn test_nested_column_tags_rejected() {
        let schema = SeriesSchema::new(
            Tags::new(),
            vec![1],
            vec![
                ColumnSchema::new(tags(&[("name", "cpu")])),
                ColumnSchema::new(tags(&[("name", "cpu"), ("core", "0")])),
            ],
        );
        match schema.validate() {
            Err(StrataError::Config(msg)) => assert!(msg.contains("ambiguous"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tag_subset() {
        let point = tags(&[("host", "web1"), ("name", "cpu")]);
        assert!(tags_subset(&tags(&[("name", "cpu")]), &point));
        assert!(tags_subset(&Tags::new(), &point));
        assert!(!tags_subset(&tags(&[("name", "mem")]), &point));
        assert_eq!(format_tags(&point), "{host=web1,name=cpu}");
    }
}
