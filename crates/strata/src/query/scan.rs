//! Windowed scan over a bucket snapshot.
//!
//! The scan walks the snapshot's data files block by block, skipping blocks
//! outside the range by header alone, reverts the needed columns into a
//! rolling buffer and hands every complete `step`-aligned window to the
//! caller. Once the files are exhausted the buffered RAM points are merged
//! in and the last, possibly partial, window is forced out.

use std::io::Cursor;
use std::ops::Range;

use crate::codec::block::BlockDecoder;
use crate::error::{Result, StrataError};
use crate::storage::bucket::BucketSnapshot;

/// Points of one `step`-aligned window.
#[derive(Debug, Clone)]
pub struct Window<'a> {
    /// Window start, aligned to the step.
    pub time: i64,
    columns: &'a [Vec<i64>],
    range: Range<usize>,
}

impl<'a> Window<'a> {
    /// Number of points in the window.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Returns true for a window without points.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Times of the window's points.
    pub fn times(&self) -> &'a [i64] {
        self.column(0)
    }

    /// Values of column `index`; empty for columns the scan did not decode.
    pub fn column(&self, index: usize) -> &'a [i64] {
        self.columns
            .get(index)
            .and_then(|c| c.get(self.range.clone()))
            .unwrap_or(&[])
    }
}

/// Aligns `time` down to a multiple of `step`.
pub fn align(time: i64, step: i64) -> i64 {
    time.div_euclid(step) * step
}

/// Streaming scan producing complete windows.
#[derive(Debug)]
pub struct WindowedScan {
    snapshot: BucketSnapshot,
    start: i64,
    end: i64,
    step: i64,
    need: Vec<bool>,
    file_index: usize,
    decoder: Option<BlockDecoder<Cursor<Vec<u8>>>>,
    columns: Vec<Vec<i64>>,
    consumed: usize,
    disk_exhausted: bool,
    done: bool,
}

impl WindowedScan {
    /// Creates a scan of `[start, end]` in windows of `step` seconds.
    ///
    /// `need` flags the columns to decode; the time column is always read.
    pub fn new(
        snapshot: BucketSnapshot,
        start: i64,
        end: i64,
        step: i64,
        need: &[bool],
    ) -> Result<Self> {
        if step < 1 {
            return Err(StrataError::InvalidStep(step));
        }
        if start > end {
            return Err(StrataError::InvalidTimeRange { start, end });
        }
        let width = snapshot.transforms.len();
        let mut mask = vec![false; width];
        for (m, &n) in mask.iter_mut().zip(need) {
            *m = n;
        }
        mask[0] = true;
        Ok(Self {
            snapshot,
            start,
            end,
            step,
            need: mask,
            file_index: 0,
            decoder: None,
            columns: vec![Vec::new(); width],
            consumed: 0,
            disk_exhausted: false,
            done: false,
        })
    }

    /// Window length in seconds.
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Returns true once every window has been emitted.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Reads the next block (or, at the end, the RAM points) and emits the
    /// windows it completes. Returns `Ok(false)` once the scan is finished.
    pub fn advance<F>(&mut self, mut emit: F) -> Result<bool>
    where
        F: FnMut(Window<'_>) -> Result<()>,
    {
        if self.done {
            return Ok(false);
        }
        let last_window = if !self.disk_exhausted && self.load_block()? {
            false
        } else {
            self.merge_ram();
            true
        };

        let times = &self.columns[0];
        let mut pos = self.consumed;
        while pos < times.len() {
            let time = align(times[pos], self.step);
            let upto = pos + times[pos..].partition_point(|&t| t < time + self.step);
            if upto == times.len() && !last_window {
                break;
            }
            emit(Window {
                time,
                columns: &self.columns,
                range: pos..upto,
            })?;
            pos = upto;
        }
        self.consumed = pos;
        self.compact();

        if last_window {
            self.done = true;
        }
        Ok(!self.done)
    }

    /// Emits every remaining window.
    pub fn run<F>(&mut self, mut emit: F) -> Result<()>
    where
        F: FnMut(Window<'_>) -> Result<()>,
    {
        while self.advance(&mut emit)? {}
        Ok(())
    }

    fn disk_limit(&self) -> Option<i64> {
        self.snapshot.last_time_on_disk.map(|l| l.min(self.end))
    }

    /// Appends the next overlapping block; returns false when the files hold
    /// nothing more inside the range.
    fn load_block(&mut self) -> Result<bool> {
        let Some(limit) = self.disk_limit() else {
            self.disk_exhausted = true;
            return Ok(false);
        };
        loop {
            if self.decoder.is_none() {
                let Some(file) = self.snapshot.files.get(self.file_index) else {
                    self.disk_exhausted = true;
                    return Ok(false);
                };
                self.file_index += 1;
                if file.end() < self.start || file.start() > limit {
                    continue;
                }
                self.decoder = Some(file.decoder()?);
            }
            let Some(decoder) = self.decoder.as_mut() else {
                continue;
            };
            let Some(header) = decoder.decode_header()? else {
                self.decoder = None;
                continue;
            };
            if header.time_last < self.start {
                continue;
            }
            if header.time_first > limit {
                self.decoder = None;
                self.disk_exhausted = true;
                return Ok(false);
            }

            let decoded = decoder.decode_block(&self.need)?;
            let times = match decoded.first() {
                Some(Some(t)) => self.snapshot.transforms[0].revert(t),
                _ => return Err(StrataError::Decode("block without time column".into())),
            };
            let after = self.columns[0].last().copied();
            let lo = times.partition_point(|&t| t < self.start || after.is_some_and(|a| t <= a));
            let hi = times.partition_point(|&t| t <= limit).max(lo);
            if lo == hi {
                continue;
            }
            for (index, column) in decoded.iter().enumerate() {
                if let Some(values) = column {
                    let reverted = if index == 0 {
                        times[lo..hi].to_vec()
                    } else {
                        self.snapshot.transforms[index].revert(values)[lo..hi].to_vec()
                    };
                    self.columns[index].extend(reverted);
                }
            }
            return Ok(true);
        }
    }

    fn merge_ram(&mut self) {
        let ram = &self.snapshot.ram;
        let after = self
            .columns[0]
            .last()
            .copied()
            .into_iter()
            .chain(self.snapshot.last_time_on_disk)
            .max();
        let times = ram.times();
        let lo = times.partition_point(|&t| t < self.start || after.is_some_and(|a| t <= a));
        let hi = times.partition_point(|&t| t <= self.end).max(lo);
        for (index, column) in self.columns.iter_mut().enumerate() {
            if self.need.get(index).copied().unwrap_or(false) && index < ram.width() {
                column.extend_from_slice(&ram.column(index)[lo..hi]);
            }
        }
    }

    fn compact(&mut self) {
        let capacity = self.columns[0].capacity();
        if self.consumed * 3 > capacity * 2 {
            for column in &mut self.columns {
                if !column.is_empty() {
                    column.drain(..self.consumed);
                }
            }
            self.consumed = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::transform::Transform;
    use crate::storage::bucket::{Bucket, BucketConfig};
    use tempfile::TempDir;

    fn bucket(dir: &TempDir) -> Bucket {
        let mut bucket =
            Bucket::open(dir.path(), BucketConfig::new(1, 1000, &[Transform::DELTA])).unwrap();
        for t in 0..2500 {
            bucket.insert(t, &[(1, t % 10)]).unwrap();
        }
        bucket.flush_until(1999).unwrap();
        bucket
    }

    fn collect(scan: &mut WindowedScan) -> Vec<(i64, usize, i64)> {
        let mut out = Vec::new();
        scan.run(|w| {
            out.push((w.time, w.len(), w.column(1).iter().sum()));
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_windows_span_disk_and_ram() {
        let dir = TempDir::new().unwrap();
        let bucket = bucket(&dir);
        let mut scan =
            WindowedScan::new(bucket.snapshot(1950, 2049), 1950, 2049, 50, &[true, true]).unwrap();
        let windows = collect(&mut scan);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0], (1950, 50, 225));
        assert_eq!(windows[1], (2000, 50, 225));
        assert!(scan.is_done());
    }

    #[test]
    fn test_unaligned_range_and_partial_window() {
        let dir = TempDir::new().unwrap();
        let bucket = bucket(&dir);
        let mut scan =
            WindowedScan::new(bucket.snapshot(5, 2499), 5, 2499, 1000, &[true, true]).unwrap();
        let windows = collect(&mut scan);
        let times: Vec<i64> = windows.iter().map(|w| w.0).collect();
        assert_eq!(times, vec![0, 1000, 2000]);
        assert_eq!(windows[0].1, 995);
        assert_eq!(windows[2].1, 500);
    }

    #[test]
    fn test_undecoded_columns_are_empty() {
        let dir = TempDir::new().unwrap();
        let bucket = bucket(&dir);
        let mut scan = WindowedScan::new(bucket.snapshot(0, 99), 0, 99, 100, &[]).unwrap();
        let mut seen = 0;
        scan.run(|w| {
            assert_eq!(w.times().len(), 100);
            assert!(w.column(1).is_empty());
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_empty_windows_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut bucket =
            Bucket::open(dir.path(), BucketConfig::new(1, 1000, &[Transform::DELTA])).unwrap();
        bucket.insert(5, &[(1, 1)]).unwrap();
        bucket.insert(305, &[(1, 2)]).unwrap();
        let mut scan =
            WindowedScan::new(bucket.snapshot(0, 400), 0, 400, 100, &[true, true]).unwrap();
        let times: Vec<i64> = collect(&mut scan).iter().map(|w| w.0).collect();
        assert_eq!(times, vec![0, 300]);
    }

    #[test]
    fn test_invalid_arguments() {
        let dir = TempDir::new().unwrap();
        let bucket = bucket(&dir);
        assert!(matches!(
            WindowedScan::new(bucket.snapshot(0, 10), 0, 10, 0, &[]),
            Err(StrataError::InvalidStep(0))
        ));
        assert!(matches!(
            WindowedScan::new(bucket.snapshot(0, 10), 10, 0, 1, &[]),
            Err(StrataError::InvalidTimeRange { .. })
        ));
    }
}
