use std::io::Write;

use tracing::debug;
use xxhash_rust::xxh64::Xxh64;

use crate::{
    SEEKABLE_MAX_FRAME_SIZE,
    buffer::ScratchBuf,
    codec::{CodecParams, FrameCompressor},
    error::{Error, Result},
    seek_table::SeekTable,
};

/// The default uncompressed frame size at which a new frame is started.
pub const DEFAULT_MIN_FRAME_SIZE: u32 = 0x20_0000;
/// The default number of frames that collapse into one seek table entry.
pub const DEFAULT_FRAMES_PER_ENTRY: u32 = 10;

/// Options that configure how archives are written.
///
/// # Examples
///
/// Supports builder like chaining.
///
/// ```
/// use seekarc::{CodecParams, Lz4Params, WriteOptions};
///
/// let writer = WriteOptions::new()
///     .codec(CodecParams::Lz4(Lz4Params::new()))
///     .min_frame_size(1 << 16)
///     .frames_per_entry(1)
///     .into_writer(Vec::new())?;
/// # Ok::<(), seekarc::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    codec: CodecParams,
    min_frame_size: Option<u32>,
    frames_per_entry: Option<u32>,
    checksums: bool,
}

impl WriteOptions {
    /// Creates a set of options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the codec and its parameters. Defaults to Zstandard.
    pub fn codec(mut self, codec: CodecParams) -> Self {
        self.codec = codec;
        self
    }

    /// The number of uncompressed bytes at which the current frame is closed.
    ///
    /// Every frame except the last holds exactly this many uncompressed
    /// bytes. Values above [`SEEKABLE_MAX_FRAME_SIZE`] are capped. Defaults
    /// to 2 MiB.
    pub fn min_frame_size(mut self, size: u32) -> Self {
        self.min_frame_size = Some(size);
        self
    }

    /// The number of compressed frames that collapse into one seek table
    /// entry. Defaults to [`DEFAULT_FRAMES_PER_ENTRY`].
    ///
    /// This is a space/latency tradeoff: larger values shrink the trailer,
    /// but a random read may have to decompress and discard up to
    /// `frames_per_entry - 1` frames of the owning entry.
    pub fn frames_per_entry(mut self, frames: u32) -> Self {
        self.frames_per_entry = Some(frames);
        self
    }

    /// Whether to record an XXH64 checksum of the uncompressed data per seek
    /// table entry.
    pub fn checksums(mut self, flag: bool) -> Self {
        self.checksums = flag;
        self
    }

    /// Creates a [`Writer`] with the configuration that emits the archive
    /// into `sink`.
    ///
    /// # Errors
    ///
    /// Fails if a parameter is out of range or the codec context cannot be
    /// created.
    pub fn into_writer<W: Write>(self, sink: W) -> Result<Writer<W>> {
        Writer::with_opts(sink, self)
    }
}

/// Writer statistics, as reported by [`Writer::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    /// The number of frames emitted so far.
    pub frames: u64,
    /// The number of seek table entries logged so far.
    pub entries: u32,
    /// The encoded length the trailer would have if the archive was finished
    /// now.
    pub seek_table_len: usize,
    /// The heap memory held by the in-memory seek table.
    pub seek_table_memory: usize,
    /// The number of bytes written to the sink so far.
    pub written_compressed: u64,
    /// Uncompressed bytes accepted but not yet part of a finished frame.
    pub pending_uncompressed: u64,
    /// The capacity of the internal work buffers.
    pub buffer_size: usize,
}

/// Writes a seekable archive to an [`std::io::Write`] sink.
///
/// The writer partitions the incoming byte stream into frames of
/// `min_frame_size` uncompressed bytes, emits each frame through the
/// configured codec, and appends the seek table trailer on
/// [`Writer::finish`]. The sink only ever sees appends; no seeking is
/// required.
///
/// A writer is not shareable. Calls must be serialized by the caller, and
/// any error from [`Writer::write`] or [`Writer::end_frame`] leaves the
/// writer in a terminal state.
///
/// # Examples
///
/// ```no_run
/// use std::{fs::File, io};
/// use seekarc::Writer;
///
/// let mut input = File::open("foo")?;
/// let output = File::create("foo.seek.zst")?;
/// let mut writer = Writer::new(output)?;
/// io::copy(&mut input, &mut writer)?;
/// // End the last frame and write the seek table to the output
/// writer.finish()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Writer<W> {
    sink: W,
    codec: FrameCompressor,
    min_frame_size: usize,
    frames_per_entry: u32,
    seek_table: SeekTable,
    in_buf: ScratchBuf,
    out_buf: ScratchBuf,
    // Current frame progress, used by the streaming mode
    frame_c_size: u64,
    frame_d_size: u64,
    frames: u64,
    // Accumulators of the seek table entry under construction
    entry_frames: u32,
    entry_c_size: u64,
    entry_d_size: u64,
    hasher: Option<Xxh64>,
    written_compressed: u64,
    poisoned: bool,
}

impl<W: std::fmt::Debug> std::fmt::Debug for Writer<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("sink", &self.sink)
            .field("codec", &self.codec)
            .field("min_frame_size", &self.min_frame_size)
            .field("frames_per_entry", &self.frames_per_entry)
            .field("seek_table", &self.seek_table)
            .field("in_buf", &self.in_buf)
            .field("out_buf", &self.out_buf)
            .field("frame_c_size", &self.frame_c_size)
            .field("frame_d_size", &self.frame_d_size)
            .field("frames", &self.frames)
            .field("entry_frames", &self.entry_frames)
            .field("entry_c_size", &self.entry_c_size)
            .field("entry_d_size", &self.entry_d_size)
            .field("hasher", &self.hasher.is_some())
            .field("written_compressed", &self.written_compressed)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl<W: Write> Writer<W> {
    /// Creates a new `Writer` with default parameters.
    ///
    /// This is equivalent to calling `WriteOptions::new().into_writer(sink)`.
    ///
    /// # Errors
    ///
    /// Fails if the writer could not be created.
    pub fn new(sink: W) -> Result<Self> {
        Self::with_opts(sink, WriteOptions::new())
    }

    /// Creates a new `Writer` with the given [`WriteOptions`].
    ///
    /// # Errors
    ///
    /// Fails if a parameter is out of range or the codec context cannot be
    /// created.
    pub fn with_opts(sink: W, opts: WriteOptions) -> Result<Self> {
        let min_frame_size = opts.min_frame_size.unwrap_or(DEFAULT_MIN_FRAME_SIZE);
        if min_frame_size == 0 {
            return Err(Error::invalid_argument("min_frame_size must be nonzero"));
        }
        let frames_per_entry = opts.frames_per_entry.unwrap_or(DEFAULT_FRAMES_PER_ENTRY);
        if frames_per_entry == 0 {
            return Err(Error::invalid_argument("frames_per_entry must be nonzero"));
        }

        let codec = FrameCompressor::new(&opts.codec)?;
        let min_frame_size = (min_frame_size as usize).min(SEEKABLE_MAX_FRAME_SIZE);
        Ok(Self {
            sink,
            codec,
            min_frame_size,
            frames_per_entry,
            seek_table: SeekTable::new(),
            in_buf: ScratchBuf::with_capacity(min_frame_size.min(128 * 1024)),
            out_buf: ScratchBuf::new(),
            frame_c_size: 0,
            frame_d_size: 0,
            frames: 0,
            entry_frames: 0,
            entry_c_size: 0,
            entry_d_size: 0,
            hasher: opts.checksums.then(|| Xxh64::new(0)),
            written_compressed: 0,
            poisoned: false,
        })
    }

    /// Consumes and compresses all of `buf`.
    ///
    /// Returns the number of bytes consumed, which is always `buf.len()`.
    /// Not safe to call concurrently; the writer has no internal lock.
    ///
    /// # Errors
    ///
    /// If compression or the sink fails. After an error the writer is
    /// unusable except for [`Writer::finish`]-free teardown by drop.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_usable()?;
        let res = if self.codec.is_streaming() {
            self.write_streaming(buf)
        } else {
            self.write_buffered(buf)
        };
        if res.is_err() {
            self.poisoned = true;
        }

        res
    }

    /// Ends the current frame, even if it is below `min_frame_size`.
    ///
    /// A no-op when no uncompressed data is pending.
    ///
    /// # Errors
    ///
    /// If compression or the sink fails; the error is terminal.
    pub fn end_frame(&mut self) -> Result<()> {
        self.check_usable()?;
        let res = if self.codec.is_streaming() {
            self.end_streamed_frame()
        } else {
            self.flush_in_buf()
        };
        if res.is_err() {
            self.poisoned = true;
        }

        res
    }

    /// Ends the last frame, logs the pending seek table entry and appends the
    /// trailer.
    ///
    /// Returns the total number of bytes written to the sink, compressed data
    /// plus trailer. The writer is consumed; all resources are released on
    /// every outcome.
    ///
    /// # Errors
    ///
    /// Fails if the last frame cannot be finished or writing the trailer
    /// fails.
    pub fn finish(mut self) -> Result<u64> {
        self.check_usable()?;
        if self.codec.is_streaming() {
            self.end_streamed_frame()?;
        } else {
            self.flush_in_buf()?;
        }
        // Force the pending entry out, regardless of frames_per_entry
        self.log_current_entry()?;

        let seek_table = std::mem::take(&mut self.seek_table);
        let entries = seek_table.num_entries();
        let mut ser = seek_table.into_serializer();
        self.out_buf.resize(4096);
        loop {
            let n = ser.write_into(self.out_buf.as_mut_slice());
            if n == 0 {
                break;
            }
            self.sink.write_all(&self.out_buf.as_slice()[..n])?;
            self.written_compressed += n as u64;
        }
        self.sink.flush()?;

        debug!(
            frames = self.frames,
            entries,
            bytes = self.written_compressed,
            "finished archive"
        );

        Ok(self.written_compressed)
    }

    /// Returns a reference to the internal [`SeekTable`].
    pub fn seek_table(&self) -> &SeekTable {
        &self.seek_table
    }

    /// Observable counters of this writer.
    pub fn stats(&self) -> WriterStats {
        let pending_entry = u32::from(self.entry_frames > 0);
        let entries = (self.seek_table.num_entries() + pending_entry) as usize;
        let size_per_entry = if self.hasher.is_some() { 12 } else { 8 };

        WriterStats {
            frames: self.frames,
            entries: self.seek_table.num_entries(),
            seek_table_len: 8 + entries * size_per_entry + 9,
            seek_table_memory: self.seek_table.memory_usage(),
            written_compressed: self.written_compressed,
            pending_uncompressed: self.in_buf.len() as u64 + self.frame_d_size,
            buffer_size: self.in_buf.capacity() + self.out_buf.capacity(),
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::invalid_argument("writer is in a failed state"));
        }

        Ok(())
    }

    fn write_buffered(&mut self, mut buf: &[u8]) -> Result<usize> {
        let total = buf.len();

        while !buf.is_empty() {
            if self.in_buf.is_empty() && buf.len() >= self.min_frame_size {
                // A whole frame is available up front, skip the input buffer
                self.emit_frame(&buf[..self.min_frame_size])?;
                buf = &buf[self.min_frame_size..];
            } else {
                let take = buf.len().min(self.min_frame_size - self.in_buf.len());
                self.in_buf.extend_from_slice(&buf[..take]);
                buf = &buf[take..];
                if self.in_buf.len() >= self.min_frame_size {
                    self.flush_in_buf()?;
                }
            }
        }

        Ok(total)
    }

    fn write_streaming(&mut self, mut buf: &[u8]) -> Result<usize> {
        let total = buf.len();

        while !buf.is_empty() {
            if self.frame_d_size == 0 {
                self.maybe_split_entry(self.min_frame_size as u64)?;
            }

            let limit = self.min_frame_size - self.frame_d_size as usize;
            let take = buf.len().min(limit);
            let chunk_size = self.codec.out_chunk_size();

            let mut consumed = 0;
            while consumed < take {
                self.out_buf.resize(chunk_size);
                let (in_progress, out_progress) = self
                    .codec
                    .stream_compress(&buf[consumed..take], self.out_buf.as_mut_slice())?;
                self.sink
                    .write_all(&self.out_buf.as_slice()[..out_progress])?;
                self.written_compressed += out_progress as u64;
                self.frame_c_size += out_progress as u64;
                consumed += in_progress;
            }

            if let Some(hasher) = &mut self.hasher {
                hasher.update(&buf[..take]);
            }
            self.frame_d_size += take as u64;
            buf = &buf[take..];

            if self.frame_d_size as usize >= self.min_frame_size {
                self.end_streamed_frame()?;
            }
        }

        Ok(total)
    }

    fn flush_in_buf(&mut self) -> Result<()> {
        if self.in_buf.is_empty() {
            return Ok(());
        }

        let mut data = std::mem::take(&mut self.in_buf);
        let res = self.emit_frame(data.as_slice());
        data.reset();
        self.in_buf = data;

        res
    }

    fn emit_frame(&mut self, data: &[u8]) -> Result<()> {
        self.maybe_split_entry(data.len() as u64)?;

        let c_size = self.codec.compress_frame(data, &mut self.out_buf)? as u64;
        self.sink.write_all(self.out_buf.as_slice())?;
        self.written_compressed += c_size;

        if let Some(hasher) = &mut self.hasher {
            hasher.update(data);
        }

        self.account_frame(c_size, data.len() as u64)
    }

    fn end_streamed_frame(&mut self) -> Result<()> {
        if self.frame_d_size == 0 {
            return Ok(());
        }

        let chunk_size = self.codec.out_chunk_size();
        loop {
            self.out_buf.resize(chunk_size);
            let (out_progress, data_left) =
                self.codec.stream_end_frame(self.out_buf.as_mut_slice())?;
            self.sink
                .write_all(&self.out_buf.as_slice()[..out_progress])?;
            self.written_compressed += out_progress as u64;
            self.frame_c_size += out_progress as u64;
            if data_left == 0 {
                break;
            }
        }

        let c_size = self.frame_c_size;
        let d_size = self.frame_d_size;
        self.frame_c_size = 0;
        self.frame_d_size = 0;

        self.account_frame(c_size, d_size)
    }

    fn account_frame(&mut self, c_size: u64, d_size: u64) -> Result<()> {
        self.frames += 1;
        self.entry_frames += 1;
        self.entry_c_size += c_size;
        self.entry_d_size += d_size;

        if self.entry_frames >= self.frames_per_entry {
            self.log_current_entry()?;
        }

        Ok(())
    }

    // Entry sizes are 32 bit on the wire; the entry is closed early when the
    // upcoming frame could overflow them.
    fn maybe_split_entry(&mut self, upcoming_d: u64) -> Result<()> {
        let upcoming_c_bound = upcoming_d + (upcoming_d >> 8) + 1024;
        if self.entry_frames > 0
            && (self.entry_d_size + upcoming_d > u64::from(u32::MAX)
                || self.entry_c_size + upcoming_c_bound > u64::from(u32::MAX))
        {
            self.log_current_entry()?;
        }

        Ok(())
    }

    fn log_current_entry(&mut self) -> Result<()> {
        if self.entry_frames == 0 {
            return Ok(());
        }

        let checksum = self.hasher.as_mut().map(|hasher| {
            // The trailer records the least significant 32 bits of the XXH64
            // hash of the entry's uncompressed data
            let digest = hasher.digest() as u32;
            *hasher = Xxh64::new(0);
            digest
        });

        self.seek_table
            .log_entry(self.entry_c_size as u32, self.entry_d_size as u32, checksum)?;
        self.entry_frames = 0;
        self.entry_c_size = 0;
        self.entry_d_size = 0;

        Ok(())
    }
}

impl<W: Write> Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Writer::write(self, buf).map_err(std::io::Error::other)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.sink.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Lz4Params, ZstdParams};

    #[test]
    fn rejects_invalid_options() {
        assert!(
            WriteOptions::new()
                .min_frame_size(0)
                .into_writer(Vec::new())
                .unwrap_err()
                .is_invalid_argument()
        );
        assert!(
            WriteOptions::new()
                .frames_per_entry(0)
                .into_writer(Vec::new())
                .unwrap_err()
                .is_invalid_argument()
        );
    }

    #[test]
    fn frames_hold_min_frame_size_bytes() {
        let mut writer = WriteOptions::new()
            .min_frame_size(4)
            .frames_per_entry(1)
            .into_writer(Vec::new())
            .unwrap();

        writer.write(&[0xAA; 10]).unwrap();
        // Two whole frames are out, two bytes are pending
        assert_eq!(writer.stats().frames, 2);
        assert_eq!(writer.stats().pending_uncompressed, 2);

        writer.end_frame().unwrap();
        assert_eq!(writer.stats().frames, 3);

        let st = writer.seek_table();
        assert_eq!(st.num_entries(), 3);
        assert_eq!(st.entry_size_decomp(0).unwrap(), 4);
        assert_eq!(st.entry_size_decomp(1).unwrap(), 4);
        assert_eq!(st.entry_size_decomp(2).unwrap(), 2);
    }

    #[test]
    fn byte_wise_writes_chunk_identically() {
        let mut writer = WriteOptions::new()
            .min_frame_size(4)
            .frames_per_entry(1)
            .into_writer(Vec::new())
            .unwrap();

        for byte in 0..10u8 {
            writer.write(&[byte]).unwrap();
        }
        writer.end_frame().unwrap();

        let st = writer.seek_table();
        assert_eq!(st.num_entries(), 3);
        assert_eq!(st.size_decomp(), 10);
        assert_eq!(st.entry_size_decomp(2).unwrap(), 2);
    }

    #[test]
    fn entries_coalesce_frames() {
        let mut writer = WriteOptions::new()
            .min_frame_size(8)
            .frames_per_entry(3)
            .into_writer(Vec::new())
            .unwrap();

        // Seven frames worth of data plus change
        writer.write(&[1u8; 60]).unwrap();
        let n = writer.finish().unwrap();
        assert!(n > 0);
    }

    #[test]
    fn entry_checksums_are_logged() {
        let data = b"checksummed data, long enough to span several frames";
        let mut writer = WriteOptions::new()
            .min_frame_size(8)
            .frames_per_entry(2)
            .checksums(true)
            .into_writer(Vec::new())
            .unwrap();
        writer.write(data).unwrap();
        writer.end_frame().unwrap();

        // Force out the pending entry to inspect it
        let mut writer = writer;
        writer.log_current_entry().unwrap();
        let st = writer.seek_table();
        assert!(st.has_checksums());

        // The first entry covers the first two frames (16 bytes)
        let expected = xxhash_rust::xxh64::xxh64(&data[..16], 0) as u32;
        assert_eq!(st.checksum(0), Some(expected));
    }

    #[test]
    fn poisoned_writer_rejects_further_writes() {
        struct FailingSink;
        impl Write for FailingSink {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("sink failed"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut writer = WriteOptions::new()
            .min_frame_size(2)
            .into_writer(FailingSink)
            .unwrap();

        assert!(writer.write(&[0; 8]).unwrap_err().is_io());
        assert!(writer.write(&[0; 8]).unwrap_err().is_invalid_argument());
        assert!(writer.end_frame().unwrap_err().is_invalid_argument());
    }

    #[test]
    fn empty_archive_is_trailer_only() {
        let mut sink = Vec::new();
        let writer = Writer::new(&mut sink).unwrap();
        let n = writer.finish().unwrap();

        // Skippable header (8) + footer (9), no entries
        assert_eq!(n, 17);
        assert_eq!(sink.len(), 17);
    }

    #[test]
    fn streaming_writer_logs_frames() {
        let mut sink = Vec::new();
        let mut writer = WriteOptions::new()
            .codec(CodecParams::Zstd(ZstdParams::new().nb_workers(2)))
            .min_frame_size(1024)
            .frames_per_entry(1)
            .into_writer(&mut sink)
            .unwrap();

        let data = vec![0x5Au8; 3000];
        writer.write(&data).unwrap();
        writer.finish().unwrap();

        let st = crate::SeekTable::from_source(sink.as_slice()).unwrap();
        assert_eq!(st.num_entries(), 3);
        assert_eq!(st.size_decomp(), 3000);
        assert_eq!(st.entry_size_decomp(0).unwrap(), 1024);
        assert_eq!(st.entry_size_decomp(2).unwrap(), 952);
    }

    #[test]
    fn lz4_writer_emits_lz4_frames() {
        let mut sink = Vec::new();
        let mut writer = WriteOptions::new()
            .codec(CodecParams::Lz4(Lz4Params::new()))
            .min_frame_size(16)
            .into_writer(&mut sink)
            .unwrap();
        writer.write(b"lz4 frame data, more than one frame long").unwrap();
        writer.finish().unwrap();

        let magic = u32::from_le_bytes(sink[..4].try_into().unwrap());
        assert_eq!(magic, crate::codec::LZ4_FRAME_MAGIC);
    }
}
