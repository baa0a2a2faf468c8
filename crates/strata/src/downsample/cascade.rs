//! Cascading downsampling between adjacent buckets.
//!
//! Buckets are passed as a slice ordered finest first; bucket `i` feeds
//! bucket `i + 1`. Inserts into bucket `i` mark windows of bucket `i + 1`
//! dirty, and [`downsample`] recomputes one aggregate row per dirty window.
//! Because the buckets are visited finest first, rows inserted into bucket
//! `i + 1` mark their own windows dirty and are carried further up in the
//! same pass.
//!
//! Rows read from the primary bucket aggregate raw values. Rows read from a
//! secondary bucket combine that bucket's stored aggregates, slot by slot.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::downsample::functions::{Aggregator, SlotMask, WindowAggregates};
use crate::error::{Result, StrataError};
use crate::query::scan::{align, Window, WindowedScan};
use crate::series::Column;
use crate::storage::bucket::Bucket;

/// Column of a bucket row that feeds aggregator `a` of `column`.
///
/// Returns `None` when a secondary bucket does not retain the slot.
pub fn source_index(column: &Column, a: Aggregator, from_primary: bool) -> Option<usize> {
    if from_primary {
        return Some(column.primary_index);
    }
    match column.aggregate_index[a.slot()] {
        0 => None,
        index => Some(index),
    }
}

/// Computes the aggregator values of one column over one window.
pub fn aggregate_window(
    column: &Column,
    window: &Window<'_>,
    from_primary: bool,
    mask: &SlotMask,
) -> WindowAggregates {
    let mut out = WindowAggregates {
        count: window.len(),
        ..Default::default()
    };
    for a in Aggregator::ALL {
        if !mask[a.slot()] {
            continue;
        }
        if let Some(index) = source_index(column, a, from_primary) {
            out.values[a.slot()] = a.reduce(window.column(index));
        }
    }
    out
}

/// Builds the secondary-bucket row for one window of the finer bucket.
pub fn downsample_row(
    columns: &[Column],
    window: &Window<'_>,
    from_primary: bool,
    width: usize,
) -> Vec<i64> {
    let mut row = vec![0i64; width];
    row[0] = window.time;
    for column in columns {
        for a in Aggregator::ALL {
            let target = column.aggregate_index[a.slot()];
            if target == 0 || target >= width {
                continue;
            }
            if let Some(source) = source_index(column, a, from_primary) {
                row[target] = a.reduce(window.column(source));
            }
        }
    }
    row
}

/// Last time bucket `index` may flush without losing later updates from the
/// finer bucket. The primary bucket may flush everything it buffers.
pub fn flush_horizon(buckets: &[Bucket], index: usize) -> Option<i64> {
    if index == 0 {
        return buckets.first().and_then(|b| b.buffer().last_time());
    }
    let resolution = buckets.get(index)?.resolution();
    let finer = buckets.get(index - 1)?.last_time_on_disk()?;
    Some(finer - resolution + 1)
}

/// Groups sorted window starts into runs of consecutive windows.
fn runs(windows: &BTreeSet<i64>, step: i64) -> Vec<(i64, i64)> {
    let mut out: Vec<(i64, i64)> = Vec::new();
    for &w in windows {
        match out.last_mut() {
            Some((_, end)) if *end + step == w => *end = w,
            _ => out.push((w, w)),
        }
    }
    out
}

fn scan_rows(buckets: &[Bucket], index: usize, start: i64, end: i64) -> Result<WindowedScan> {
    let finer = &buckets[index];
    let step = buckets[index + 1].resolution();
    WindowedScan::new(
        finer.snapshot(start, end),
        start,
        end,
        step,
        &vec![true; finer.width()],
    )
}

fn insert_rows(bucket: &mut Bucket, rows: Vec<Vec<i64>>) -> Result<usize> {
    let mut inserted = 0;
    for row in rows {
        match bucket.insert_row(&row) {
            Ok(_) => inserted += 1,
            Err(e @ StrataError::TimeArchived { .. }) => {
                warn!(resolution = bucket.resolution(), error = %e, "dropping downsampled row");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(inserted)
}

fn downsample_level(buckets: &mut [Bucket], columns: &[Column], index: usize) -> Result<usize> {
    let dirty = buckets[index].take_dirty();
    if dirty.is_empty() {
        return Ok(0);
    }
    let step = buckets[index + 1].resolution();
    let width = buckets[index + 1].width();
    let from_primary = index == 0;

    let mut rows = Vec::new();
    for (first, last) in runs(&dirty, step) {
        let scanned = scan_rows(buckets, index, first, last + step - 1).and_then(|mut scan| {
            scan.run(|w| {
                rows.push(downsample_row(columns, &w, from_primary, width));
                Ok(())
            })
        });
        if let Err(e) = scanned {
            buckets[index].restore_dirty(dirty);
            return Err(e);
        }
    }
    insert_rows(&mut buckets[index + 1], rows)
}

/// Recomputes every dirty window, finest bucket first.
///
/// Returns the number of rows written into coarser buckets.
pub fn downsample(buckets: &mut [Bucket], columns: &[Column]) -> Result<usize> {
    let mut total = 0;
    for index in 0..buckets.len().saturating_sub(1) {
        total += downsample_level(buckets, columns, index)?;
    }
    if total > 0 {
        debug!(rows = total, "downsample pass");
    }
    Ok(total)
}

/// Replays the backlog of every coarser bucket from its finer neighbour.
///
/// Each coarser bucket resumes one resolution step after its last time on
/// disk (or at the finer bucket's earliest data) and is force-flushed up to
/// its horizon whenever `force_flush_points` rows are buffered.
pub fn downsample_startup(
    buckets: &mut [Bucket],
    columns: &[Column],
    force_flush_points: usize,
) -> Result<usize> {
    let mut total = 0;
    for index in 0..buckets.len().saturating_sub(1) {
        let step = buckets[index + 1].resolution();
        let from = match buckets[index + 1].last_time_on_disk() {
            Some(last) => last + step,
            None => match buckets[index].earliest_time()? {
                Some(t) => align(t, step),
                None => continue,
            },
        };
        let to = buckets[index]
            .last_time_on_disk()
            .into_iter()
            .chain(buckets[index].buffer().last_time())
            .max();
        let Some(to) = to else { continue };
        if from > to {
            continue;
        }

        let width = buckets[index + 1].width();
        let from_primary = index == 0;
        let mut scan = scan_rows(buckets, index, from, to)?;
        let mut replayed = 0;
        loop {
            let mut rows = Vec::new();
            let more = scan.advance(|w| {
                rows.push(downsample_row(columns, &w, from_primary, width));
                Ok(())
            })?;
            replayed += insert_rows(&mut buckets[index + 1], rows)?;
            if buckets[index + 1].buffer().len() >= force_flush_points.max(1) {
                if let Some(horizon) = flush_horizon(buckets, index + 1) {
                    buckets[index + 1].flush_until(horizon)?;
                }
            }
            if !more {
                break;
            }
        }
        info!(
            resolution = step,
            from,
            to,
            rows = replayed,
            "caught up coarser bucket"
        );
        total += replayed;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runs_group_consecutive_windows() {
        let windows: BTreeSet<i64> = [0, 10, 20, 50, 70, 80].into_iter().collect();
        assert_eq!(runs(&windows, 10), vec![(0, 20), (50, 50), (70, 80)]);
        assert!(runs(&BTreeSet::new(), 10).is_empty());
    }
}
