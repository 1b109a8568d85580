//! This crate provides seekable compressed archives with random-access
//! reads.
//!
//! An archive is a series of independent compressed frames, either Zstandard
//! or LZ4, followed by a seek table inside a Zstandard skippable frame. The
//! writer partitions a sequential byte stream into frames; because every
//! frame is compressed on its own, reading a section in the middle of an
//! archive only decompresses at most a seek table entry's worth of extra
//! data instead of the entire archive.
//!
//! The frames are plainly appended, so decompressing a ZSTD archive from
//! front to back with any compliant decoder still regenerates the original
//! content, and the trailer is wire-compatible with the Zstandard Seekable
//! Format.
//!
//! # Getting Started
//!
//! - The [`Writer`] compresses a byte stream into a seekable archive.
//! - The [`Reader`] performs random-access reads at decompressed byte
//!   offsets, and can be shared between threads.
//! - The [`SeekTable`] maps decompressed offsets to frame locations; it gets
//!   created and updated automatically during compression.
//!
//! Zstandard frames use bindings from the [`zstd_safe`] crate, LZ4 frames
//! the [`lz4_flex`] crate.
//!
//! [`zstd_safe`]: https://docs.rs/zstd-safe/latest/zstd_safe/
//! [`lz4_flex`]: https://docs.rs/lz4_flex/latest/lz4_flex/

mod buffer;
mod cache;
mod codec;
mod error;
mod io;
mod reader;
pub mod seek_table;
mod writer;

pub use codec::{
    CodecKind, CodecParams, LZ4_FRAME_MAGIC, Lz4BlockSize, Lz4Params, ZSTD_FRAME_MAGIC,
    ZstdParams, ZstdStrategy,
};
pub use error::{Error, Result};
pub use io::SeekableSource;
pub use reader::{DEFAULT_CACHE_ENTRIES, ReadOptions, Reader, ReaderStats};
pub use seek_table::SeekTable;
pub use writer::{
    DEFAULT_FRAMES_PER_ENTRY, DEFAULT_MIN_FRAME_SIZE, WriteOptions, Writer, WriterStats,
};
// Re-export as it's part of the API.
pub use zstd_safe::CompressionLevel;

/// The magic number of the seek table footer.
pub const SEEKABLE_MAGIC_NUMBER: u32 = 0x8F92_EAB1;
/// The maximum number of seek table entries in an archive.
pub const SEEKABLE_MAX_FRAMES: u32 = 0x0800_0000;
/// The size of the seek table footer.
pub const SEEK_TABLE_FOOTER_SIZE: usize = 9;
/// The maximum size of the uncompressed data of a frame.
pub const SEEKABLE_MAX_FRAME_SIZE: usize = 0x4000_0000;
/// The size of the skippable frame header.
///
/// Skippable magic number (4 bytes) + frame size field (4 bytes)
pub(crate) const SKIPPABLE_HEADER_SIZE: usize = 8;

#[doc = include_str!("../../README.md")]
#[cfg(doctest)]
pub struct ReadmeDoctests;
