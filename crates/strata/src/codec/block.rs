//! Fixed-size on-disk blocks.
//!
//! ## Binary Layout
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    1       version (u8)
//! 0x01    1       num_columns (u8, time column included)
//! 0x02    4       num_points (u32 LE)
//! 0x06    2       bytes_used (u16 LE)
//! 0x08    8       time_first (i64 LE)
//! 0x10    8       time_last (i64 LE)
//! 0x18    ...     packed column bodies, column 0 (time) first
//! ...     ...     zero padding up to BLOCK_SIZE
//! ```
//!
//! Every column of a block describes the same `num_points` points. Column
//! bodies carry no length prefix; a reader walks words until the value
//! counts reach `num_points`.

use std::io::{self, Read, Write};

use crate::codec::packing::{unpack_into, word_kind, PackedColumn, WordKind};
use crate::error::{Result, StrataError};

/// Total size of a block on disk.
pub const BLOCK_SIZE: usize = 4096;

/// Size of the block header.
pub const BLOCK_HEADER_SIZE: usize = 24;

/// Current block format version.
pub const BLOCK_VERSION: u8 = 1;

/// Number of 64-bit words shared by all column bodies of a block.
pub const WORD_BUDGET: usize = (BLOCK_SIZE - BLOCK_HEADER_SIZE) / 8;

/// Most columns a block header can describe, the time column included.
pub const MAX_BLOCK_COLUMNS: usize = u8::MAX as usize;

/// Upper bound on the points a single block can hold.
pub const MAX_BLOCK_POINTS: usize = WORD_BUDGET * crate::codec::packing::MAX_VALUES_PER_WORD;

/// Block header (24 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block format version.
    pub version: u8,
    /// Number of column bodies, time column included.
    pub num_columns: u8,
    /// Number of points described by every column.
    pub num_points: u32,
    /// Header plus body bytes; the rest of the block is padding.
    pub bytes_used: u16,
    /// Time of the first point (untransformed).
    pub time_first: i64,
    /// Time of the last point (untransformed).
    pub time_last: i64,
}

impl BlockHeader {
    /// Writes the header using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[self.version, self.num_columns])?;
        writer.write_all(&self.num_points.to_le_bytes())?;
        writer.write_all(&self.bytes_used.to_le_bytes())?;
        writer.write_all(&self.time_first.to_le_bytes())?;
        writer.write_all(&self.time_last.to_le_bytes())?;
        Ok(())
    }

    /// Parses a header from its 24-byte representation.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::UnsupportedVersion` for unknown versions and
    /// `StrataError::Decode` when `bytes_used` is out of bounds.
    pub fn from_bytes(buf: &[u8; BLOCK_HEADER_SIZE]) -> Result<Self> {
        let mut b2 = [0u8; 2];
        let mut b4 = [0u8; 4];
        let mut b8 = [0u8; 8];

        b4.copy_from_slice(&buf[2..6]);
        let num_points = u32::from_le_bytes(b4);
        b2.copy_from_slice(&buf[6..8]);
        let bytes_used = u16::from_le_bytes(b2);
        b8.copy_from_slice(&buf[8..16]);
        let time_first = i64::from_le_bytes(b8);
        b8.copy_from_slice(&buf[16..24]);
        let time_last = i64::from_le_bytes(b8);

        let header = Self {
            version: buf[0],
            num_columns: buf[1],
            num_points,
            bytes_used,
            time_first,
            time_last,
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.version != BLOCK_VERSION {
            return Err(StrataError::UnsupportedVersion(self.version));
        }
        let used = self.bytes_used as usize;
        if !(BLOCK_HEADER_SIZE..=BLOCK_SIZE).contains(&used) {
            return Err(StrataError::Decode(format!(
                "bytes_used {} outside [{}, {}]",
                used, BLOCK_HEADER_SIZE, BLOCK_SIZE
            )));
        }
        if self.num_points > 0 && self.time_first > self.time_last {
            return Err(StrataError::Decode(format!(
                "time_first {} after time_last {}",
                self.time_first, self.time_last
            )));
        }
        Ok(())
    }
}

/// Result of encoding one block.
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    /// Header written at the start of `bytes`.
    pub header: BlockHeader,
    /// Exactly `BLOCK_SIZE` bytes.
    pub bytes: Vec<u8>,
    /// Number of leading input points stored in the block.
    pub points: usize,
}

/// A column clipped to the block point limit and packed up to the budget.
struct Candidate<'a> {
    values: &'a [u64],
    packed: PackedColumn,
}

fn pack_columns(columns: &[Vec<u64>]) -> Vec<Candidate<'_>> {
    columns
        .iter()
        .map(|c| {
            let values = &c[..c.len().min(MAX_BLOCK_POINTS)];
            Candidate {
                values,
                packed: PackedColumn::pack_limited(values, WORD_BUDGET),
            }
        })
        .collect()
}

fn total_words(candidates: &[Candidate<'_>], points: usize) -> Option<usize> {
    candidates.iter().try_fold(0usize, |acc, c| {
        c.packed.words_for(c.values, points).map(|w| acc + w)
    })
}

/// Returns the number of words all columns need to store exactly their
/// first `points` values, or `None` if a single column alone overflows the
/// budget.
pub fn block_words_needed(columns: &[Vec<u64>], points: usize) -> Option<usize> {
    total_words(&pack_columns(columns), points)
}

/// Encodes the largest prefix of the given columns that fits in one block.
///
/// `times` holds the untransformed time column (used for the header range)
/// and `columns[0]` its transformed form; the remaining entries are
/// transformed value columns. All columns must have the same length.
///
/// # Errors
///
/// Returns `StrataError::ColumnMismatch` for ragged input and
/// `StrataError::Config` when not even one point fits.
pub fn encode_block(times: &[i64], columns: &[Vec<u64>]) -> Result<EncodedBlock> {
    if columns.is_empty() || columns.len() > MAX_BLOCK_COLUMNS {
        return Err(StrataError::Config(format!(
            "block needs 1..={} columns, got {}",
            MAX_BLOCK_COLUMNS,
            columns.len()
        )));
    }
    if times.is_empty() {
        return Err(StrataError::Config("cannot encode an empty block".into()));
    }
    for column in columns {
        if column.len() != times.len() {
            return Err(StrataError::ColumnMismatch {
                expected: times.len(),
                actual: column.len(),
            });
        }
    }

    let candidates = pack_columns(columns);
    let fits = |n: usize| total_words(&candidates, n).is_some_and(|w| w <= WORD_BUDGET);

    // Ends on n with fits(n) and !fits(n + 1), or on the point limit.
    let (mut lo, mut hi) = (0usize, times.len().min(MAX_BLOCK_POINTS));
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    let points = lo;
    if points == 0 {
        return Err(StrataError::Config(format!(
            "{} columns do not fit a single point into a block",
            columns.len()
        )));
    }

    let mut body = Vec::with_capacity(WORD_BUDGET);
    for c in &candidates {
        let words = c.packed.prefix_words(c.values, points).ok_or_else(|| {
            StrataError::Config(format!("{} points no longer fit the block", points))
        })?;
        body.extend(words);
    }
    let words = body.len();
    let header = BlockHeader {
        version: BLOCK_VERSION,
        num_columns: columns.len() as u8,
        num_points: points as u32,
        bytes_used: (BLOCK_HEADER_SIZE + words * 8) as u16,
        time_first: times[0],
        time_last: times[points - 1],
    };

    let mut bytes = Vec::with_capacity(BLOCK_SIZE);
    header.write_to(&mut bytes)?;
    for word in &body {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes.resize(BLOCK_SIZE, 0);

    Ok(EncodedBlock {
        header,
        bytes,
        points,
    })
}

/// Decoder state; transitions are driven by [`BlockDecoder`] calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderState {
    /// No reader attached yet.
    Uninitialized,
    /// Positioned at the start of a block.
    AtHeader,
    /// Header consumed, body not yet read.
    InBody(BlockHeader),
    /// A fatal error occurred; only `attach` recovers.
    Error(String),
}

/// Streaming decoder over a sequence of fixed-size blocks.
///
/// `Uninitialized -> AtHeader -> InBody -> AtHeader -> ...`; any short read
/// or malformed word moves it to `Error` until a new reader is attached.
#[derive(Debug)]
pub struct BlockDecoder<R> {
    reader: Option<R>,
    state: DecoderState,
}

impl<R: Read> Default for BlockDecoder<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Read> BlockDecoder<R> {
    /// Creates a decoder with no reader attached.
    pub fn new() -> Self {
        Self {
            reader: None,
            state: DecoderState::Uninitialized,
        }
    }

    /// Creates a decoder positioned at the first header of `reader`.
    pub fn with_reader(reader: R) -> Self {
        let mut decoder = Self::new();
        decoder.attach(reader);
        decoder
    }

    /// Attaches a new reader, clearing any previous error.
    pub fn attach(&mut self, reader: R) {
        self.reader = Some(reader);
        self.state = DecoderState::AtHeader;
    }

    /// Returns the current state.
    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// Returns true if the decoder is in the permanent error state.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, DecoderState::Error(_))
    }

    fn fail(&mut self, msg: String) -> StrataError {
        self.state = DecoderState::Error(msg.clone());
        StrataError::Decode(msg)
    }

    /// Reads the next block header.
    ///
    /// If the previous block's body was not decoded it is skipped first.
    /// Returns `Ok(None)` at a clean end of stream.
    pub fn decode_header(&mut self) -> Result<Option<BlockHeader>> {
        match &self.state {
            DecoderState::Uninitialized => {
                return Err(StrataError::Decode("no reader attached".into()))
            }
            DecoderState::Error(msg) => return Err(StrataError::DecoderFailed(msg.clone())),
            DecoderState::InBody(_) => {
                if let Err(msg) = self.skip((BLOCK_SIZE - BLOCK_HEADER_SIZE) as u64) {
                    return Err(self.fail(msg));
                }
                self.state = DecoderState::AtHeader;
            }
            DecoderState::AtHeader => {}
        }

        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        let read = match self.read_up_to(&mut buf) {
            Ok(n) => n,
            Err(e) => return Err(self.fail(format!("header read failed: {}", e))),
        };
        if read == 0 {
            return Ok(None);
        }
        if read < BLOCK_HEADER_SIZE {
            return Err(self.fail(format!("short header read: {} bytes", read)));
        }
        match BlockHeader::from_bytes(&buf) {
            Ok(header) => {
                self.state = DecoderState::InBody(header);
                Ok(Some(header))
            }
            Err(e) => {
                self.state = DecoderState::Error(e.to_string());
                Err(e)
            }
        }
    }

    /// Decodes the body of the block whose header was just read.
    ///
    /// Columns flagged in `need` are returned as transformed values; the
    /// others are skipped (their words are still consumed) and come back as
    /// `None`. `need[0]` refers to the time column.
    pub fn decode_block(&mut self, need: &[bool]) -> Result<Vec<Option<Vec<u64>>>> {
        let header = match &self.state {
            DecoderState::InBody(header) => *header,
            DecoderState::Error(msg) => return Err(StrataError::DecoderFailed(msg.clone())),
            _ => {
                return Err(StrataError::Decode(
                    "decode_block called without a pending header".into(),
                ))
            }
        };
        if header.num_columns as usize > need.len() {
            return Err(self.fail(format!(
                "block has {} columns but only {} are known",
                header.num_columns,
                need.len()
            )));
        }

        match self.read_body(&header, need) {
            Ok(columns) => {
                self.state = DecoderState::AtHeader;
                Ok(columns)
            }
            Err(msg) => Err(self.fail(msg)),
        }
    }

    fn read_body(
        &mut self,
        header: &BlockHeader,
        need: &[bool],
    ) -> std::result::Result<Vec<Option<Vec<u64>>>, String> {
        let reader = self.reader.as_mut().ok_or("no reader attached")?;
        let points = header.num_points as usize;
        let mut consumed = BLOCK_HEADER_SIZE;
        let mut columns = Vec::with_capacity(header.num_columns as usize);

        for &wanted in need.iter().take(header.num_columns as usize) {
            let mut values = if wanted {
                Vec::with_capacity(points + crate::codec::packing::MAX_VALUES_PER_WORD)
            } else {
                Vec::new()
            };
            let mut seen = 0usize;
            while seen < points {
                let word = read_word(reader, &mut consumed, header.bytes_used)?;
                match word_kind(word).map_err(|e| e.to_string())? {
                    WordKind::Packed { count, bits } => {
                        if wanted {
                            unpack_into(word, count, bits, &mut values);
                        }
                        seen += count;
                    }
                    WordKind::Escape => {
                        let raw = read_word(reader, &mut consumed, header.bytes_used)?;
                        if wanted {
                            values.push(raw);
                        }
                        seen += 1;
                    }
                }
            }
            if wanted {
                values.truncate(points);
                columns.push(Some(values));
            } else {
                columns.push(None);
            }
        }

        let padding = (BLOCK_SIZE - consumed) as u64;
        let skipped = io::copy(&mut reader.by_ref().take(padding), &mut io::sink())
            .map_err(|e| format!("padding read failed: {}", e))?;
        if skipped != padding {
            return Err(format!("short block: missing {} padding bytes", padding - skipped));
        }
        Ok(columns)
    }

    fn skip(&mut self, bytes: u64) -> std::result::Result<(), String> {
        let reader = self.reader.as_mut().ok_or("no reader attached")?;
        let skipped = io::copy(&mut reader.by_ref().take(bytes), &mut io::sink())
            .map_err(|e| format!("skip failed: {}", e))?;
        if skipped != bytes {
            return Err(format!("short block body: skipped {} of {}", skipped, bytes));
        }
        Ok(())
    }

    fn read_up_to(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };
        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

fn read_word<R: Read>(
    reader: &mut R,
    consumed: &mut usize,
    bytes_used: u16,
) -> std::result::Result<u64, String> {
    if *consumed + 8 > bytes_used as usize {
        return Err(format!(
            "column body overruns bytes_used {} at offset {}",
            bytes_used, consumed
        ));
    }
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|e| format!("short word read at offset {}: {}", consumed, e))?;
    *consumed += 8;
    Ok(u64::from_le_bytes(buf))
}
