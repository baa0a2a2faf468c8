//! Selector-word integer packing.
//!
//! Every 64-bit word describes itself: the top 4 bits hold a selector, the
//! low 60 bits hold `count` values of `bits` width each, least significant
//! value first.
//!
//! ```text
//! selector  count  bits      selector  count  bits
//! --------  -----  ----      --------  -----  ----
//!    0       240     0           8        8     7
//!    1     escape    -           9        7     8
//!    2        60     1          10        6    10
//!    3        30     2          11        5    12
//!    4        20     3          12        4    15
//!    5        15     4          13        3    20
//!    6        12     5          14        2    30
//!    7        10     6          15        1    60
//! ```
//!
//! Selector 1 is an escape: the value does not fit in 60 bits and is stored
//! raw in the word that follows. The final word of a stream may be padded
//! with zeros; readers stop at the point count recorded in the block header.

use bitvec::prelude::*;

use crate::error::{Result, StrataError};

/// Selector reserved for a raw 64-bit value in the following word.
pub const ESCAPE_SELECTOR: u8 = 1;

const PAYLOAD_BITS: u32 = 60;
const PAYLOAD_MASK: u64 = (1 << PAYLOAD_BITS) - 1;

/// `(count, bits)` for each selector; the escape row is unused.
const SELECTORS: [(usize, u32); 16] = [
    (240, 0),
    (1, 64),
    (60, 1),
    (30, 2),
    (20, 3),
    (15, 4),
    (12, 5),
    (10, 6),
    (8, 7),
    (7, 8),
    (6, 10),
    (5, 12),
    (4, 15),
    (3, 20),
    (2, 30),
    (1, 60),
];

/// Selectors tried by the packer, densest first.
const PACK_ORDER: [u8; 15] = [0, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

/// Largest number of values a single word can describe.
pub const MAX_VALUES_PER_WORD: usize = 240;

/// What a word read from a stream contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordKind {
    /// `count` values of `bits` width packed in this word.
    Packed {
        /// Number of values in the word (including any padding).
        count: usize,
        /// Width of each value in bits.
        bits: u32,
    },
    /// One raw value stored in the next word.
    Escape,
}

/// Classifies a packed word.
///
/// # Errors
///
/// Returns `StrataError::Decode` for words whose payload is inconsistent
/// with their selector.
pub fn word_kind(word: u64) -> Result<WordKind> {
    let selector = (word >> PAYLOAD_BITS) as u8;
    let payload = word & PAYLOAD_MASK;
    if selector == ESCAPE_SELECTOR {
        if payload != 0 {
            return Err(StrataError::Decode(format!(
                "escape word carries payload {:#x}",
                payload
            )));
        }
        return Ok(WordKind::Escape);
    }
    let (count, bits) = SELECTORS[selector as usize];
    if bits == 0 && payload != 0 {
        return Err(StrataError::Decode(format!(
            "zero-width word carries payload {:#x}",
            payload
        )));
    }
    Ok(WordKind::Packed { count, bits })
}

/// Unpacks the values of a `Packed` word into `out`.
pub fn unpack_into(word: u64, count: usize, bits: u32, out: &mut Vec<u64>) {
    if bits == 0 {
        out.resize(out.len() + count, 0);
        return;
    }
    let width = bits as usize;
    let view = word.view_bits::<Lsb0>();
    for i in 0..count {
        out.push(view[i * width..(i + 1) * width].load_le::<u64>());
    }
}

/// Boundary of one packed unit (a word, or an escape plus its raw word).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UnitEnd {
    words: usize,
    values: usize,
}

/// A column packed into selector words, with per-word coverage so that
/// callers can ask how many words the first `n` values occupy.
#[derive(Debug, Clone)]
pub struct PackedColumn {
    words: Vec<u64>,
    units: Vec<UnitEnd>,
    limit: usize,
}

impl PackedColumn {
    /// Packs all of `values`.
    pub fn pack(values: &[u64]) -> Self {
        Self::pack_limited(values, usize::MAX)
    }

    /// Packs `values` greedily, stopping once `max_words` words are emitted.
    pub fn pack_limited(values: &[u64], max_words: usize) -> Self {
        let mut packed = Self {
            words: Vec::new(),
            units: Vec::new(),
            limit: max_words,
        };
        let mut pos = 0;
        while pos < values.len() && packed.words.len() < max_words {
            pos += packed.push_unit(&values[pos..]);
            packed.units.push(UnitEnd {
                words: packed.words.len(),
                values: pos.min(values.len()),
            });
        }
        packed
    }

    /// Emits the densest word that holds a prefix of `rest`, returning the
    /// number of values it consumed.
    fn push_unit(&mut self, rest: &[u64]) -> usize {
        for &selector in PACK_ORDER.iter() {
            let (count, bits) = SELECTORS[selector as usize];
            let take = count.min(rest.len());
            let limit = if bits == 0 { 0 } else { (1u64 << bits) - 1 };
            if rest[..take].iter().all(|&v| v <= limit) {
                let mut word = (selector as u64) << PAYLOAD_BITS;
                if bits > 0 {
                    let width = bits as usize;
                    let view = word.view_bits_mut::<Lsb0>();
                    for (i, &v) in rest[..take].iter().enumerate() {
                        view[i * width..(i + 1) * width].store_le(v);
                    }
                }
                self.words.push(word);
                return take;
            }
        }
        self.words.push((ESCAPE_SELECTOR as u64) << PAYLOAD_BITS);
        self.words.push(rest[0]);
        1
    }

    /// Returns the packed words.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Number of values covered by the packed words.
    pub fn covered(&self) -> usize {
        self.units.last().map_or(0, |u| u.values)
    }

    /// Returns how many words a packing of exactly the first `points` of
    /// `values` takes, or `None` if it would not fit the word limit.
    ///
    /// `values` must be the slice this column was packed from.
    pub fn words_for(&self, values: &[u64], points: usize) -> Option<usize> {
        self.split_prefix(values, points)
            .map(|(shared, tail)| shared + tail.words.len())
    }

    /// Returns the words of a packing of exactly the first `points` values.
    pub fn prefix_words(&self, values: &[u64], points: usize) -> Option<Vec<u64>> {
        let (shared, tail) = self.split_prefix(values, points)?;
        let mut words = self.words[..shared].to_vec();
        words.extend_from_slice(&tail.words);
        Some(words)
    }

    /// Splits the packing of a prefix into leading words shared with this
    /// packing and a repacked tail.
    ///
    /// The packer looks at most one word span ahead, so a unit that ends a
    /// full span before `points` is chosen the same way for the prefix.
    fn split_prefix(&self, values: &[u64], points: usize) -> Option<(usize, PackedColumn)> {
        if points > values.len() {
            return None;
        }
        let kept = self
            .units
            .partition_point(|u| u.values + MAX_VALUES_PER_WORD <= points);
        let (shared, start) = match kept.checked_sub(1) {
            Some(i) => (self.units[i].words, self.units[i].values),
            None => (0, 0),
        };
        let tail = Self::pack_limited(&values[start..points], self.limit.saturating_sub(shared));
        if tail.covered() < points - start {
            return None;
        }
        Some((shared, tail))
    }
}
