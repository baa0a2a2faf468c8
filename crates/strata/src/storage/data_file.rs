//! Append-only data files made of fixed-size blocks.
//!
//! A data file covers one resolution-aligned time window of a bucket and is
//! named after the window start: `{start:011}.mdb`. Blocks are only ever
//! appended, except the most recent one, which may be rewritten in place.

use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::error;

use crate::codec::block::{BlockDecoder, BlockHeader, BLOCK_SIZE};
use crate::error::{Result, StrataError};

/// Extension of data files.
pub const DATA_FILE_EXTENSION: &str = "mdb";

/// Width of the zero-padded start time in a data file name.
pub const DATA_FILE_NAME_DIGITS: usize = 11;

#[derive(Debug)]
struct FileState {
    file: File,
    blocks: usize,
    poisoned: bool,
}

/// One data file of a bucket.
///
/// Readers and the single writer coordinate through a per-file read/write
/// lock, so a reader never observes a block that is being written.
#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    start: i64,
    end: i64,
    state: RwLock<FileState>,
}

impl DataFile {
    /// Builds the file name for a window starting at `start`.
    pub fn file_name(start: i64) -> String {
        format!(
            "{:0width$}.{}",
            start,
            DATA_FILE_EXTENSION,
            width = DATA_FILE_NAME_DIGITS
        )
    }

    /// Parses a data file name back into its start time.
    ///
    /// Only names made of exactly 11 ASCII digits plus the extension are
    /// accepted.
    pub fn parse_file_name(name: &str) -> Option<i64> {
        let stem = name.strip_suffix(DATA_FILE_EXTENSION)?.strip_suffix('.')?;
        if stem.len() != DATA_FILE_NAME_DIGITS || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok()
    }

    /// Creates (or reopens) the data file for the window `[start, start + window)`.
    pub fn create(dir: &Path, start: i64, window: i64) -> Result<Self> {
        let path = dir.join(Self::file_name(start));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len() as usize;
        Ok(Self {
            path,
            start,
            end: start + window - 1,
            state: RwLock::new(FileState {
                file,
                blocks: len / BLOCK_SIZE,
                poisoned: false,
            }),
        })
    }

    /// Opens an existing data file after checking it against the naming,
    /// size and alignment contract.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::Config` describing the violation for a
    /// non-conforming file.
    pub fn open(path: &Path, window: i64) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StrataError::Config(format!("invalid file name {:?}", path)))?;
        let start = Self::parse_file_name(name)
            .ok_or_else(|| StrataError::Config(format!("unexpected file name {}", name)))?;
        if start.rem_euclid(window) != 0 {
            return Err(StrataError::Config(format!(
                "start time {} of {} not aligned to window {}",
                start, name, window
            )));
        }
        let len = fs::metadata(path)?.len() as usize;
        if len % BLOCK_SIZE != 0 {
            return Err(StrataError::Config(format!(
                "size {} of {} is not a multiple of {}",
                len, name, BLOCK_SIZE
            )));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            start,
            end: start + window - 1,
            state: RwLock::new(FileState {
                file,
                blocks: len / BLOCK_SIZE,
                poisoned: false,
            }),
        })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, FileState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, FileState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// First time covered by this file.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Last time covered by this file (inclusive).
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Returns true if `time` falls inside the file's window.
    pub fn contains(&self, time: i64) -> bool {
        (self.start..=self.end).contains(&time)
    }

    /// Number of complete blocks in the file.
    pub fn block_count(&self) -> usize {
        self.read_state().blocks
    }

    /// Returns true once a partial write has been detected.
    pub fn is_poisoned(&self) -> bool {
        self.read_state().poisoned
    }

    /// Writes one block, rewriting the last block when `overwrite` is set
    /// and the file is non-empty, appending otherwise.
    ///
    /// The block is handed to a single `write` call. A short write poisons
    /// the file: every later write fails with `StrataError::FilePoisoned`.
    pub fn write_block(&self, buf: &[u8], overwrite: bool) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(StrataError::InvalidBlockSize(buf.len()));
        }
        let mut state = self.write_state();
        if state.poisoned {
            error!(path = %self.path.display(), "refusing write to poisoned data file");
            return Err(StrataError::FilePoisoned(self.path.clone()));
        }

        let index = if overwrite && state.blocks > 0 {
            state.blocks - 1
        } else {
            state.blocks
        };
        state.file.seek(SeekFrom::Start((index * BLOCK_SIZE) as u64))?;
        let written = state.file.write(buf)?;
        if written != BLOCK_SIZE {
            state.poisoned = true;
            error!(
                path = %self.path.display(),
                written,
                expected = BLOCK_SIZE,
                "partial block write, data file poisoned"
            );
            return Err(StrataError::PartialWrite {
                path: self.path.clone(),
                written,
                expected: BLOCK_SIZE,
            });
        }
        state.blocks = state.blocks.max(index + 1);
        Ok(())
    }

    /// Flushes written blocks to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.read_state().file.sync_data()?;
        Ok(())
    }

    /// Reads the raw bytes of block `index`.
    pub fn read_block(&self, index: usize) -> Result<Vec<u8>> {
        let state = self.read_state();
        if index >= state.blocks {
            return Err(StrataError::Decode(format!(
                "block {} out of range ({} blocks in {})",
                index,
                state.blocks,
                self.path.display()
            )));
        }
        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start((index * BLOCK_SIZE) as u64))?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads every complete block of the file in one pass.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let state = self.read_state();
        let mut bytes = fs::read(&self.path)?;
        bytes.truncate(state.blocks * BLOCK_SIZE);
        Ok(bytes)
    }

    /// Returns a decoder positioned at the first block.
    pub fn decoder(&self) -> Result<BlockDecoder<Cursor<Vec<u8>>>> {
        Ok(BlockDecoder::with_reader(Cursor::new(self.read_all()?)))
    }

    /// Reads the header of the last block, if any.
    pub fn last_header(&self) -> Result<Option<BlockHeader>> {
        let blocks = self.block_count();
        if blocks == 0 {
            return Ok(None);
        }
        let mut decoder = BlockDecoder::with_reader(Cursor::new(self.read_block(blocks - 1)?));
        decoder.decode_header()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::block::encode_block;
    use crate::codec::transform::Transform;
    use tempfile::TempDir;

    fn block(first: i64, n: i64) -> Vec<u8> {
        let times: Vec<i64> = (0..n).map(|i| first + i).collect();
        let columns = vec![Transform::TIME.apply(&times), Transform::DELTA.apply(&times)];
        encode_block(&times, &columns).unwrap().bytes
    }

    #[test]
    fn test_file_name_roundtrip() {
        assert_eq!(DataFile::file_name(86_400), "00000086400.mdb");
        assert_eq!(DataFile::parse_file_name("00000086400.mdb"), Some(86_400));
        assert_eq!(DataFile::parse_file_name("86400.mdb"), None);
        assert_eq!(DataFile::parse_file_name("0000008640a.mdb"), None);
        assert_eq!(DataFile::parse_file_name("00000086400.dat"), None);
    }

    #[test]
    fn test_append_and_overwrite() {
        let dir = TempDir::new().unwrap();
        let file = DataFile::create(dir.path(), 0, 1000).unwrap();
        assert_eq!(file.block_count(), 0);

        // Overwrite on an empty file appends.
        file.write_block(&block(0, 10), true).unwrap();
        file.write_block(&block(10, 10), false).unwrap();
        assert_eq!(file.block_count(), 2);

        file.write_block(&block(10, 20), true).unwrap();
        assert_eq!(file.block_count(), 2);
        let header = file.last_header().unwrap().unwrap();
        assert_eq!(header.time_first, 10);
        assert_eq!(header.time_last, 29);
        assert_eq!(
            fs::metadata(file.path()).unwrap().len() as usize,
            2 * BLOCK_SIZE
        );
    }

    #[test]
    fn test_wrong_block_size_rejected() {
        let dir = TempDir::new().unwrap();
        let file = DataFile::create(dir.path(), 0, 1000).unwrap();
        assert!(matches!(
            file.write_block(&[0u8; 100], false),
            Err(StrataError::InvalidBlockSize(100))
        ));
        assert_eq!(file.block_count(), 0);
    }

    #[test]
    fn test_open_validates_contract() {
        let dir = TempDir::new().unwrap();
        {
            let file = DataFile::create(dir.path(), 2000, 1000).unwrap();
            file.write_block(&block(2000, 5), false).unwrap();
        }
        let good = dir.path().join("00000002000.mdb");
        let opened = DataFile::open(&good, 1000).unwrap();
        assert_eq!(opened.block_count(), 1);
        assert_eq!(opened.end(), 2999);
        assert!(opened.contains(2999) && !opened.contains(3000));

        assert!(DataFile::open(&good, 3000).is_err());

        let torn = dir.path().join("00000003000.mdb");
        fs::write(&torn, vec![0u8; BLOCK_SIZE + 7]).unwrap();
        assert!(DataFile::open(&torn, 1000).is_err());
    }

    #[test]
    fn test_decoder_reads_all_blocks() {
        let dir = TempDir::new().unwrap();
        let file = DataFile::create(dir.path(), 0, 1000).unwrap();
        file.write_block(&block(0, 10), false).unwrap();
        file.write_block(&block(10, 10), false).unwrap();

        let mut decoder = file.decoder().unwrap();
        let mut firsts = Vec::new();
        while let Some(header) = decoder.decode_header().unwrap() {
            firsts.push(header.time_first);
        }
        assert_eq!(firsts, vec![0, 10]);
    }
}
