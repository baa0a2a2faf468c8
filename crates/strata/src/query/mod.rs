//! Query engine.
//!
//! A [`Query`] is planned on the thread that owns the buckets: it picks the
//! coarsest bucket able to answer the request and captures snapshots of the
//! buckets it needs. It then runs anywhere, pulling [`QueryBuffer`] chunks
//! from one [`BucketQuerySource`] per segment.
//!
//! # Planning
//!
//! A bucket is eligible when its resolution divides the step and it retains
//! every aggregator slot the requested functions read; the primary bucket
//! is always eligible. Windows the finer buckets have not downsampled yet
//! (their dirty windows) are not reliable in the coarse bucket, so the plan
//! cuts over to the next finer bucket at the earliest dirty window.

pub mod cluster;
pub mod scan;
pub mod source;

use std::collections::VecDeque;

use crate::downsample::functions::{Aggregator, FunctionKind, FunctionState};
use crate::error::{Result, StrataError};
use crate::series::Column;
use crate::storage::bucket::{Bucket, BucketSnapshot};

pub use cluster::{ClusterConfig, ClusterKey, QueryClusterer, QueryExecutor, QueryTicket};
pub use scan::{align, Window, WindowedScan};
pub use source::BucketQuerySource;

/// One requested output column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnRequest {
    /// Index into the series columns.
    pub column: usize,
    /// Function evaluated per window.
    pub function: FunctionKind,
}

impl ColumnRequest {
    /// Creates a request for `function` over column `column`.
    pub fn new(column: usize, function: FunctionKind) -> Self {
        Self { column, function }
    }
}

/// A chunk of query results: one time per window and one value array per
/// requested column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryBuffer {
    /// Window start times.
    pub times: Vec<i64>,
    /// Values, one array per requested column.
    pub values: Vec<Vec<f64>>,
}

impl QueryBuffer {
    /// Creates an empty buffer with `columns` value arrays.
    pub fn new(columns: usize) -> Self {
        Self {
            times: Vec::new(),
            values: vec![Vec::new(); columns],
        }
    }

    /// Number of windows.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Returns true for a buffer without windows.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Appends the windows of `other`.
    pub fn append(&mut self, mut other: QueryBuffer) {
        self.times.append(&mut other.times);
        if self.values.len() < other.values.len() {
            self.values.resize(other.values.len(), Vec::new());
        }
        for (dst, mut src) in self.values.iter_mut().zip(other.values) {
            dst.append(&mut src);
        }
    }

    /// Copies the value arrays at `indices`, keeping the times.
    pub fn select(&self, indices: &[usize]) -> QueryBuffer {
        QueryBuffer {
            times: self.times.clone(),
            values: indices
                .iter()
                .map(|&i| self.values.get(i).cloned().unwrap_or_default())
                .collect(),
        }
    }
}

#[derive(Debug)]
struct Segment {
    snapshot: BucketSnapshot,
    start: i64,
    end: i64,
    from_primary: bool,
}

/// Chained per-bucket sources answering one request.
#[derive(Debug)]
pub struct Query {
    columns: Vec<Column>,
    requests: Vec<ColumnRequest>,
    step: i64,
    segments: VecDeque<Segment>,
    current: Option<BucketQuerySource>,
    states: Option<Vec<FunctionState>>,
    failed: bool,
}

fn eligible(
    bucket: &Bucket,
    index: usize,
    columns: &[Column],
    requests: &[ColumnRequest],
    step: i64,
) -> bool {
    if index == 0 {
        return true;
    }
    let resolution = bucket.resolution();
    if resolution > step || step % resolution != 0 {
        return false;
    }
    requests.iter().all(|r| {
        if r.function.needs_raw_points() {
            return false;
        }
        let mask = r.function.slot_mask();
        Aggregator::ALL
            .iter()
            .all(|a| !mask[a.slot()] || columns[r.column].aggregate_index[a.slot()] != 0)
    })
}

impl Query {
    /// Plans a query over `buckets` (finest first).
    ///
    /// # Errors
    ///
    /// Returns `StrataError::InvalidTimeRange`, `StrataError::InvalidStep`
    /// or `StrataError::UnknownColumn` for malformed requests.
    pub fn plan(
        buckets: &[Bucket],
        columns: &[Column],
        requests: &[ColumnRequest],
        start: i64,
        end: i64,
        step: i64,
    ) -> Result<Self> {
        if start > end {
            return Err(StrataError::InvalidTimeRange { start, end });
        }
        if step < 1 {
            return Err(StrataError::InvalidStep(step));
        }
        if let Some(bad) = requests.iter().find(|r| r.column >= columns.len()) {
            return Err(StrataError::UnknownColumn(format!("column index {}", bad.column)));
        }

        let mut segments = VecDeque::new();
        let mut seg_start = start;
        let mut upper = buckets.len();
        while upper > 0 {
            let index = (1..upper)
                .rev()
                .find(|&i| eligible(&buckets[i], i, columns, requests, step))
                .unwrap_or(0);
            let cutover = buckets[..index]
                .iter()
                .filter_map(|b| b.dirty_windows().first().copied())
                .min()
                .map(|c| scan::align(c, step));
            let seg_end = cutover.map_or(end, |c| (c - 1).min(end));
            if seg_end >= seg_start {
                segments.push_back(Segment {
                    snapshot: buckets[index].snapshot(seg_start, seg_end),
                    start: seg_start,
                    end: seg_end,
                    from_primary: index == 0,
                });
            }
            match cutover {
                Some(c) if c <= end && index > 0 => {
                    seg_start = seg_start.max(c);
                    upper = index;
                }
                _ => break,
            }
        }

        Ok(Self {
            columns: columns.to_vec(),
            requests: requests.to_vec(),
            step,
            segments,
            current: None,
            states: None,
            failed: false,
        })
    }

    /// Resolution, start and end of each planned segment, in order.
    pub fn segments(&self) -> Vec<(i64, i64, i64)> {
        self.segments
            .iter()
            .map(|s| (s.snapshot.resolution, s.start, s.end))
            .collect()
    }

    /// Requested output columns.
    pub fn requests(&self) -> &[ColumnRequest] {
        &self.requests
    }

    /// Drains the query into a single buffer.
    pub fn collect_all(self) -> Result<QueryBuffer> {
        let mut out = QueryBuffer::new(self.requests.len());
        for chunk in self {
            out.append(chunk?);
        }
        Ok(out)
    }

    fn open_next(&mut self) -> Option<Result<BucketQuerySource>> {
        let segment = self.segments.pop_front()?;
        let states = self.states.take().unwrap_or_else(|| {
            self.requests
                .iter()
                .map(|r| r.function.instantiate())
                .collect()
        });
        Some(BucketQuerySource::new(
            segment.snapshot,
            &self.columns,
            &self.requests,
            states,
            segment.start,
            segment.end,
            self.step,
            segment.from_primary,
        ))
    }
}

impl Iterator for Query {
    type Item = Result<QueryBuffer>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if self.current.is_none() {
                match self.open_next()? {
                    Ok(source) => self.current = Some(source),
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
            }
            let source = self.current.as_mut()?;
            match source.next_chunk() {
                Ok(Some(chunk)) => return Some(Ok(chunk)),
                Ok(None) => {
                    self.states = self.current.take().map(BucketQuerySource::into_states);
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
