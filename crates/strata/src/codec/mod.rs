//! Block codec: column transforms, selector-word packing and the fixed-size
//! block format.
//!
//! # Components
//!
//! - [`Transform`]: reversible difference + zig-zag mapping
//! - [`PackedColumn`]: self-describing 64-bit word packing
//! - [`encode_block`] / [`BlockDecoder`]: 4096-byte blocks and their
//!   streaming decoder

pub mod block;
pub mod packing;
pub mod transform;

pub use block::{
    encode_block, BlockDecoder, BlockHeader, DecoderState, EncodedBlock, BLOCK_HEADER_SIZE,
    BLOCK_SIZE, BLOCK_VERSION, MAX_BLOCK_COLUMNS, WORD_BUDGET,
};
pub use packing::PackedColumn;
pub use transform::Transform;
