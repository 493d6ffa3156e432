#![forbid(unsafe_code)]
//! Metadata-file layer: record codec, scoped file handle, and the
//! free-space manager for page images.
//!
//! The metadata file is the sole coordination artifact between the writer
//! and its readers. It has exactly two live record regions — a fixed-size
//! header at byte 0 and an index record right behind it — plus page-aligned
//! image regions allocated from page 1 upward. Records are little-endian
//! and CRC32C-trailed; the header's tick number commits a publication.

pub mod codec;
pub mod file;
pub mod freespace;

pub use codec::{
    MD_HEADER_MAGIC, MD_HEADER_SIZE, MD_INDEX_ENTRY_SIZE, MD_INDEX_MAGIC, MdHeader,
    decode_header, decode_index, encode_header, encode_index, index_record_size,
};
pub use file::{MD_LOAD_RETRY_MAX, MetadataFile};
pub use freespace::MdFreeSpace;
