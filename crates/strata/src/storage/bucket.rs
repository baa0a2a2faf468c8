//! One resolution tier of a series.
//!
//! A bucket owns the data files of its tier, the buffer of points that have
//! not reached disk yet, and the set of coarser-tier windows its inserts
//! have invalidated. Buckets never reference each other; the series keeps
//! them in an ordered array and adjacency is index arithmetic.
//!
//! # Flush
//!
//! Buffered points are split at file-window boundaries and encoded into as
//! many blocks as they need. When the last block written stays below the
//! reuse threshold, its points are kept and re-encoded together with the
//! next flush so the block is rewritten in place instead of wasting space.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::block::{encode_block, BLOCK_HEADER_SIZE, MAX_BLOCK_POINTS};
use crate::codec::transform::Transform;
use crate::error::{Result, StrataError};
use crate::storage::buffer::PointBuffer;
use crate::storage::data_file::DataFile;

/// Static layout of a bucket.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    /// Seconds per point.
    pub resolution: i64,
    /// Points per data file; a file covers `resolution * points_per_file`.
    pub points_per_file: i64,
    /// The last block is rewritten while its used bytes stay below this.
    pub reuse_size: usize,
    /// One transform per column, the time column first.
    pub transforms: Vec<Transform>,
    /// Resolution of the next coarser bucket, if any.
    pub next_resolution: Option<i64>,
}

impl BucketConfig {
    /// Creates a layout with the time transform followed by `values`.
    pub fn new(resolution: i64, points_per_file: i64, values: &[Transform]) -> Self {
        let mut transforms = Vec::with_capacity(values.len() + 1);
        transforms.push(Transform::TIME);
        transforms.extend_from_slice(values);
        Self {
            resolution,
            points_per_file,
            reuse_size: 0,
            transforms,
            next_resolution: None,
        }
    }

    /// Sets the reuse threshold.
    pub fn with_reuse_size(mut self, reuse_size: usize) -> Self {
        self.reuse_size = reuse_size;
        self
    }

    /// Sets the resolution of the next coarser bucket.
    pub fn with_next_resolution(mut self, next: i64) -> Self {
        self.next_resolution = Some(next);
        self
    }

    /// Time span of one data file.
    pub fn window(&self) -> i64 {
        self.resolution * self.points_per_file
    }
}

/// Outcome of one flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    /// New points persisted.
    pub points: usize,
    /// Blocks written (appended or rewritten).
    pub blocks: usize,
}

#[derive(Debug)]
struct ReusableBlock {
    file_start: i64,
    columns: Vec<Vec<i64>>,
}

/// Read-only view of a bucket used by queries off the owning thread.
#[derive(Debug, Clone)]
pub struct BucketSnapshot {
    /// Seconds per point.
    pub resolution: i64,
    /// Column transforms, time first.
    pub transforms: Vec<Transform>,
    /// Data files overlapping the snapshot range, oldest first.
    pub files: Vec<Arc<DataFile>>,
    /// Copy of the buffered points in the snapshot range.
    pub ram: PointBuffer,
    /// Last time on disk when the snapshot was taken.
    pub last_time_on_disk: Option<i64>,
}

/// A single resolution tier.
#[derive(Debug)]
pub struct Bucket {
    dir: PathBuf,
    config: BucketConfig,
    files: Vec<Arc<DataFile>>,
    buffer: PointBuffer,
    last_time_on_disk: Option<i64>,
    dirty: BTreeSet<i64>,
    reuse: Option<ReusableBlock>,
}

impl Bucket {
    /// Opens the bucket stored in `dir`, creating the directory if needed.
    ///
    /// Files that do not follow the data file contract are skipped with a
    /// warning. The last block of the newest file restores the last time on
    /// disk, and is kept for reuse when it is small enough.
    pub fn open(dir: impl Into<PathBuf>, config: BucketConfig) -> Result<Self> {
        let dir = dir.into();
        if config.resolution < 1 || config.points_per_file < 1 {
            return Err(StrataError::Config(format!(
                "invalid bucket layout: resolution {} points_per_file {}",
                config.resolution, config.points_per_file
            )));
        }
        fs::create_dir_all(&dir)?;

        let window = config.window();
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            match DataFile::open(&path, window) {
                Ok(file) => files.push(Arc::new(file)),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping data file"),
            }
        }
        files.sort_by_key(|f| f.start());

        let mut bucket = Self {
            buffer: PointBuffer::new(config.transforms.len()),
            dir,
            config,
            files,
            last_time_on_disk: None,
            dirty: BTreeSet::new(),
            reuse: None,
        };
        bucket.recover_tail()?;
        Ok(bucket)
    }

    fn recover_tail(&mut self) -> Result<()> {
        let Some(file) = self.files.iter().rev().find(|f| f.block_count() > 0).cloned() else {
            return Ok(());
        };
        let Some(header) = file.last_header()? else {
            return Ok(());
        };
        self.last_time_on_disk = Some(header.time_last);

        if (header.bytes_used as usize) >= self.config.reuse_size
            || header.num_columns as usize != self.width()
        {
            return Ok(());
        }
        let bytes = file.read_block(file.block_count() - 1)?;
        let mut decoder = crate::codec::block::BlockDecoder::with_reader(bytes.as_slice());
        decoder.decode_header()?;
        let decoded = decoder.decode_block(&vec![true; self.width()])?;
        let columns = decoded
            .iter()
            .zip(&self.config.transforms)
            .map(|(c, t)| t.revert(c.as_deref().unwrap_or_default()))
            .collect();
        self.reuse = Some(ReusableBlock {
            file_start: file.start(),
            columns,
        });
        Ok(())
    }

    /// Directory holding this bucket's data files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Seconds per point.
    pub fn resolution(&self) -> i64 {
        self.config.resolution
    }

    /// Layout of this bucket.
    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Number of columns, time included.
    pub fn width(&self) -> usize {
        self.config.transforms.len()
    }

    /// Time of the newest point on disk.
    pub fn last_time_on_disk(&self) -> Option<i64> {
        self.last_time_on_disk
    }

    /// Buffered points.
    pub fn buffer(&self) -> &PointBuffer {
        &self.buffer
    }

    /// Data files, oldest first.
    pub fn files(&self) -> &[Arc<DataFile>] {
        &self.files
    }

    /// Coarser-tier windows invalidated since the last downsample pass.
    pub fn dirty_windows(&self) -> &BTreeSet<i64> {
        &self.dirty
    }

    /// Removes and returns the dirty windows.
    pub fn take_dirty(&mut self) -> BTreeSet<i64> {
        std::mem::take(&mut self.dirty)
    }

    /// Marks windows dirty again after a failed downsample pass.
    pub fn restore_dirty(&mut self, windows: BTreeSet<i64>) {
        self.dirty.extend(windows);
    }

    /// Oldest time stored by the bucket, on disk or buffered.
    pub fn earliest_time(&self) -> Result<Option<i64>> {
        for file in &self.files {
            if file.block_count() == 0 {
                continue;
            }
            let mut decoder = file.decoder()?;
            if let Some(header) = decoder.decode_header()? {
                return Ok(Some(header.time_first));
            }
        }
        Ok(self.buffer.first_time())
    }

    fn check_insert(&self, time: i64) -> Result<()> {
        match self.last_time_on_disk {
            Some(last) if time <= last => Err(StrataError::TimeArchived {
                time,
                last_time_on_disk: last,
            }),
            _ => Ok(()),
        }
    }

    fn mark_dirty(&mut self, time: i64) {
        if let Some(next) = self.config.next_resolution {
            self.dirty.insert(time.div_euclid(next) * next);
        }
    }

    /// Buffers values for the point at `time` (see [`PointBuffer::insert`]).
    ///
    /// # Errors
    ///
    /// Returns `StrataError::TimeArchived` if `time` is not newer than the
    /// last time on disk.
    pub fn insert(&mut self, time: i64, values: &[(usize, i64)]) -> Result<bool> {
        self.check_insert(time)?;
        let created = self.buffer.insert(time, values)?;
        self.mark_dirty(time);
        Ok(created)
    }

    /// Buffers a full row, `row[0]` being the time.
    pub fn insert_row(&mut self, row: &[i64]) -> Result<bool> {
        let Some(&time) = row.first() else {
            return Err(StrataError::ColumnMismatch {
                expected: self.width(),
                actual: 0,
            });
        };
        self.check_insert(time)?;
        let created = self.buffer.insert_row(row)?;
        self.mark_dirty(time);
        Ok(created)
    }

    /// Returns the data file covering `times[0]`, creating it if needed, and
    /// the number of leading `times` that fall inside its window.
    pub fn get_storage_time(&mut self, times: &[i64]) -> Result<(Arc<DataFile>, usize)> {
        let Some(&first) = times.first() else {
            return Err(StrataError::InvalidTimeRange { start: 0, end: -1 });
        };
        let window = self.config.window();
        let start = first.div_euclid(window) * window;
        let file = match self.files.binary_search_by_key(&start, |f| f.start()) {
            Ok(i) => Arc::clone(&self.files[i]),
            Err(i) => {
                let file = Arc::new(DataFile::create(&self.dir, start, window)?);
                debug!(path = %file.path().display(), "created data file");
                self.files.insert(i, Arc::clone(&file));
                file
            }
        };
        let count = times.partition_point(|&t| t <= file.end());
        Ok((file, count))
    }

    /// Persists every buffered point with time `<= limit`.
    pub fn flush_until(&mut self, limit: i64) -> Result<FlushStats> {
        let n = self.buffer.count_until(limit);
        if n == 0 {
            return Ok(FlushStats::default());
        }
        let mut columns = self.buffer.drain_front(n);
        let mut overwrite = false;
        let mut stats = FlushStats {
            points: n,
            blocks: 0,
        };

        if let Some(reuse) = self.reuse.take() {
            let window = self.config.window();
            if columns[0][0].div_euclid(window) * window == reuse.file_start {
                for (dst, mut src) in columns.iter_mut().zip(reuse.columns) {
                    src.append(dst);
                    *dst = src;
                }
                overwrite = true;
            }
        }

        let mut offset = 0;
        let result = self.write_columns(&columns, &mut offset, &mut overwrite, &mut stats);
        if let Err(e) = result {
            // Give back what did not reach disk.
            let keep_from = match self.last_time_on_disk {
                Some(last) => columns[0].partition_point(|&t| t <= last).max(offset),
                None => offset,
            };
            let rest: Vec<Vec<i64>> = columns.iter().map(|c| c[keep_from..].to_vec()).collect();
            self.buffer.prepend(rest);
            return Err(e);
        }

        debug!(
            dir = %self.dir.display(),
            resolution = self.config.resolution,
            points = stats.points,
            blocks = stats.blocks,
            "flushed bucket"
        );
        Ok(stats)
    }

    fn write_columns(
        &mut self,
        columns: &[Vec<i64>],
        offset: &mut usize,
        overwrite: &mut bool,
        stats: &mut FlushStats,
    ) -> Result<()> {
        let total = columns[0].len();
        let mut touched: Vec<Arc<DataFile>> = Vec::new();
        while *offset < total {
            let (file, count) = self.get_storage_time(&columns[0][*offset..])?;
            let file_end = *offset + count;
            while *offset < file_end {
                let upto = file_end.min(*offset + MAX_BLOCK_POINTS);
                let times = &columns[0][*offset..upto];
                let transformed: Vec<Vec<u64>> = columns
                    .iter()
                    .zip(&self.config.transforms)
                    .map(|(c, t)| t.apply(&c[*offset..upto]))
                    .collect();
                let block = encode_block(times, &transformed)?;
                file.write_block(&block.bytes, *overwrite)?;
                *overwrite = false;
                stats.blocks += 1;

                let block_end = *offset + block.points;
                self.last_time_on_disk = Some(
                    self.last_time_on_disk
                        .map_or(block.header.time_last, |t| t.max(block.header.time_last)),
                );
                let used = block.header.bytes_used as usize;
                self.reuse = if used < self.config.reuse_size && used > BLOCK_HEADER_SIZE {
                    Some(ReusableBlock {
                        file_start: file.start(),
                        columns: columns.iter().map(|c| c[*offset..block_end].to_vec()).collect(),
                    })
                } else {
                    None
                };
                *offset = block_end;
            }
            if !touched.iter().any(|f| Arc::ptr_eq(f, &file)) {
                touched.push(file);
            }
        }
        for file in touched {
            file.sync()?;
        }
        Ok(())
    }

    /// Persists every buffered point.
    pub fn flush_all(&mut self) -> Result<FlushStats> {
        match self.buffer.last_time() {
            Some(last) => self.flush_until(last),
            None => Ok(FlushStats::default()),
        }
    }

    /// Captures the files and buffered points overlapping `[start, end]`.
    pub fn snapshot(&self, start: i64, end: i64) -> BucketSnapshot {
        let disk_end = self.last_time_on_disk.map_or(i64::MIN, |l| l.min(end));
        BucketSnapshot {
            resolution: self.config.resolution,
            transforms: self.config.transforms.clone(),
            files: self
                .files
                .iter()
                .filter(|f| f.end() >= start && f.start() <= disk_end)
                .cloned()
                .collect(),
            ram: self.buffer.range(start, end),
            last_time_on_disk: self.last_time_on_disk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::block::BLOCK_SIZE;
    use tempfile::TempDir;

    fn config() -> BucketConfig {
        BucketConfig::new(10, 100, &[Transform::DELTA]).with_next_resolution(100)
    }

    #[test]
    fn test_insert_marks_dirty_window() {
        let dir = TempDir::new().unwrap();
        let mut bucket = Bucket::open(dir.path(), config()).unwrap();
        bucket.insert(120, &[(1, 1)]).unwrap();
        bucket.insert(190, &[(1, 1)]).unwrap();
        bucket.insert(200, &[(1, 1)]).unwrap();
        let dirty: Vec<i64> = bucket.take_dirty().into_iter().collect();
        assert_eq!(dirty, vec![100, 200]);
        assert!(bucket.dirty_windows().is_empty());
    }

    #[test]
    fn test_get_storage_time_splits_at_window() {
        let dir = TempDir::new().unwrap();
        let mut bucket = Bucket::open(dir.path(), config()).unwrap();
        let times = [980, 990, 1000, 1010];
        let (file, count) = bucket.get_storage_time(&times).unwrap();
        assert_eq!(file.start(), 0);
        assert_eq!(count, 2);
        let (file, count) = bucket.get_storage_time(&times[2..]).unwrap();
        assert_eq!(file.start(), 1000);
        assert_eq!(count, 2);
        assert_eq!(bucket.files().len(), 2);
    }

    #[test]
    fn test_flush_across_files_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut bucket = Bucket::open(dir.path(), config()).unwrap();
            for t in (0..2500).step_by(10) {
                bucket.insert(t, &[(1, t / 10)]).unwrap();
            }
            let stats = bucket.flush_until(1990).unwrap();
            assert_eq!(stats.points, 200);
            assert_eq!(stats.blocks, 2);
            assert_eq!(bucket.last_time_on_disk(), Some(1990));
            assert_eq!(bucket.buffer().len(), 50);
            assert!(matches!(
                bucket.insert(1990, &[(1, 0)]),
                Err(StrataError::TimeArchived { .. })
            ));
        }
        let bucket = Bucket::open(dir.path(), config()).unwrap();
        assert_eq!(bucket.files().len(), 2);
        assert_eq!(bucket.last_time_on_disk(), Some(1990));
        assert_eq!(bucket.earliest_time().unwrap(), Some(0));
        assert!(bucket.buffer().is_empty());
    }

    #[test]
    fn test_small_last_block_is_rewritten() {
        let dir = TempDir::new().unwrap();
        let cfg = config().with_reuse_size(BLOCK_SIZE);
        let mut bucket = Bucket::open(dir.path(), cfg.clone()).unwrap();
        for t in [0, 10, 20] {
            bucket.insert(t, &[(1, 1)]).unwrap();
        }
        bucket.flush_all().unwrap();
        for t in [30, 40] {
            bucket.insert(t, &[(1, 2)]).unwrap();
        }
        let stats = bucket.flush_all().unwrap();
        assert_eq!(stats.points, 2);
        assert_eq!(stats.blocks, 1);

        let file = Arc::clone(&bucket.files()[0]);
        assert_eq!(file.block_count(), 1);
        let header = file.last_header().unwrap().unwrap();
        assert_eq!(header.num_points, 5);
        assert_eq!((header.time_first, header.time_last), (0, 40));

        // Reuse state survives a reopen.
        drop(bucket);
        let mut bucket = Bucket::open(dir.path(), cfg).unwrap();
        bucket.insert(50, &[(1, 3)]).unwrap();
        bucket.flush_all().unwrap();
        let header = bucket.files()[0].last_header().unwrap().unwrap();
        assert_eq!(bucket.files()[0].block_count(), 1);
        assert_eq!(header.num_points, 6);
    }

    #[test]
    fn test_reuse_does_not_cross_files() {
        let dir = TempDir::new().unwrap();
        let mut bucket = Bucket::open(dir.path(), config().with_reuse_size(BLOCK_SIZE)).unwrap();
        bucket.insert(990, &[(1, 1)]).unwrap();
        bucket.flush_all().unwrap();
        bucket.insert(1000, &[(1, 1)]).unwrap();
        bucket.flush_all().unwrap();
        assert_eq!(bucket.files().len(), 2);
        assert_eq!(bucket.files()[0].block_count(), 1);
        assert_eq!(bucket.files()[1].block_count(), 1);
    }

    #[test]
    fn test_open_skips_foreign_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        fs::write(dir.path().join("00000000005.mdb"), vec![0u8; BLOCK_SIZE]).unwrap();
        let bucket = Bucket::open(dir.path(), config()).unwrap();
        assert!(bucket.files().is_empty());
        assert_eq!(bucket.last_time_on_disk(), None);
    }

    #[test]
    fn test_snapshot_range() {
        let dir = TempDir::new().unwrap();
        let mut bucket = Bucket::open(dir.path(), config()).unwrap();
        for t in (0..3000).step_by(10) {
            bucket.insert(t, &[(1, 1)]).unwrap();
        }
        bucket.flush_until(2500).unwrap();
        let snap = bucket.snapshot(1500, 2800);
        assert_eq!(snap.files.len(), 2);
        assert_eq!(snap.ram.first_time(), Some(2510));
        assert_eq!(snap.ram.last_time(), Some(2800));
        assert_eq!(snap.last_time_on_disk, Some(2500));
    }
}
