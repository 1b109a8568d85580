use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::{
    buffer::ScratchBuf,
    cache::FrameCache,
    codec::{CodecKind, FrameDecoder},
    error::{Error, Result},
    io::{SeekableSource, read_exact_at},
    seek_table::{EntryLocation, SeekTable},
};

/// The default number of decompressed entries retained by the reader cache.
pub const DEFAULT_CACHE_ENTRIES: usize = 16;

/// Options that configure how archives are read.
///
/// # Examples
///
/// Supports builder like chaining.
///
/// ```no_run
/// use std::fs::File;
/// use seekarc::{CodecKind, ReadOptions};
///
/// let archive = File::open("data.seek.zst")?;
/// let reader = ReadOptions::new(archive)
///     .cache_entries(32)
///     .codec_hint(CodecKind::Zstd)
///     .into_reader()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct ReadOptions<S> {
    src: S,
    cache_entries: usize,
    codec_hint: Option<CodecKind>,
}

impl<S: SeekableSource> ReadOptions<S> {
    /// Creates a set of options with default values. `src` holds the
    /// seekable archive.
    pub fn new(src: S) -> Self {
        Self {
            src,
            cache_entries: DEFAULT_CACHE_ENTRIES,
            codec_hint: None,
        }
    }

    /// The maximum number of decompressed entries kept in memory. Zero
    /// disables caching entirely.
    pub fn cache_entries(mut self, entries: usize) -> Self {
        self.cache_entries = entries;
        self
    }

    /// Overrides codec auto detection.
    pub fn codec_hint(mut self, kind: CodecKind) -> Self {
        self.codec_hint = Some(kind);
        self
    }

    /// Builds a [`Reader`] with the configuration.
    ///
    /// # Errors
    ///
    /// Fails if the seek table cannot be parsed or the codec cannot be
    /// detected.
    pub fn into_reader(self) -> Result<Reader<S>> {
        Reader::with_opts(self)
    }
}

/// Reader statistics, as reported by [`Reader::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderStats {
    /// The number of seek table entries of the archive.
    pub entries: u32,
    /// The decompressed size of the archive.
    pub size_decomp: u64,
    /// The heap memory held by the parsed seek table.
    pub seek_table_memory: usize,
    /// The decompressed bytes currently owned by the cache.
    pub cache_memory: usize,
    /// The number of entries currently cached.
    pub cached_entries: usize,
    /// How many reads were served from the cache.
    pub cache_hits: u64,
    /// How many reads had to decompress.
    pub cache_misses: u64,
    /// The capacity of the internal work buffers.
    pub buffer_size: usize,
}

// Codec context and scratch buffers of the decompression path. Guarded by a
// mutex that is only taken on the exclusive (miss) path.
#[derive(Debug)]
struct DecodeState {
    decoder: FrameDecoder,
    comp_buf: ScratchBuf,
    discard: ScratchBuf,
}

impl DecodeState {
    fn fetch<S: SeekableSource>(&mut self, src: &S, loc: &EntryLocation) -> Result<()> {
        let c_size = usize::try_from(loc.c_size)?;
        self.comp_buf.resize(c_size);
        read_exact_at(src, self.comp_buf.as_mut_slice(), loc.c_offset)?;

        Ok(())
    }

    /// Fetches and decompresses a whole entry into an owned buffer.
    fn decode_entry<S: SeekableSource>(
        &mut self,
        src: &S,
        loc: &EntryLocation,
    ) -> Result<Vec<u8>> {
        self.fetch(src, loc)?;
        let mut out = vec![0; usize::try_from(loc.d_size)?];
        let Self {
            decoder,
            comp_buf,
            discard,
        } = self;
        decoder.decompress_entry(comp_buf.as_slice(), 0, &mut out, discard)?;

        Ok(out)
    }

    /// Fetches an entry and decompresses only the requested window into
    /// `buf`, discarding the prefix before `offset_in_entry`.
    fn decode_into<S: SeekableSource>(
        &mut self,
        src: &S,
        loc: &EntryLocation,
        buf: &mut [u8],
    ) -> Result<()> {
        self.fetch(src, loc)?;
        let Self {
            decoder,
            comp_buf,
            discard,
        } = self;
        decoder.decompress_entry(comp_buf.as_slice(), loc.offset_in_entry, buf, discard)?;

        Ok(())
    }
}

/// Random-access reads from a seekable archive.
///
/// A `Reader` parses the seek table when it is opened and resolves any
/// decompressed byte offset to the owning entry with a binary search. Entry
/// data is fetched with positional reads, decompressed, and retained in a
/// bounded LRU cache.
///
/// A single reader serves concurrent [`Reader::pread`] calls from multiple
/// threads: cache hits copy out under a shared lock, only cache misses
/// serialize on the decompression state.
///
/// # Examples
///
/// ```no_run
/// use std::fs::File;
/// use seekarc::Reader;
///
/// let archive = File::open("data.seek.zst")?;
/// let reader = Reader::open(archive)?;
///
/// let mut buf = vec![0; 128];
/// let n = reader.pread(&mut buf, 4096)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct Reader<S> {
    src: S,
    seek_table: SeekTable,
    codec: CodecKind,
    cache: Option<RwLock<FrameCache>>,
    decode: Mutex<DecodeState>,
    pos: u64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl<S: SeekableSource> Reader<S> {
    /// Opens the archive in `src` with default options.
    ///
    /// This is equivalent to calling `ReadOptions::new(src).into_reader()`.
    ///
    /// # Errors
    ///
    /// Fails if the seek table cannot be parsed or the codec cannot be
    /// detected.
    pub fn open(src: S) -> Result<Self> {
        ReadOptions::new(src).into_reader()
    }

    /// Creates a new `Reader` with the given [`ReadOptions`].
    ///
    /// # Errors
    ///
    /// Fails if the seek table cannot be parsed or the codec cannot be
    /// detected.
    pub fn with_opts(opts: ReadOptions<S>) -> Result<Self> {
        let seek_table = SeekTable::from_source(&opts.src)?;

        let codec = match opts.codec_hint {
            Some(kind) => kind,
            // An archive without frames has no magic to inspect; any codec
            // satisfies its (empty) reads
            None if seek_table.num_entries() == 0 => CodecKind::Zstd,
            None => {
                let mut magic = [0u8; 4];
                read_exact_at(&opts.src, &mut magic, 0)?;
                CodecKind::detect(u32::from_le_bytes(magic))?
            }
        };

        debug!(
            ?codec,
            entries = seek_table.num_entries(),
            size_decomp = seek_table.size_decomp(),
            cache_entries = opts.cache_entries,
            "opened archive"
        );

        let decoder = FrameDecoder::new(codec)?;
        Ok(Self {
            src: opts.src,
            seek_table,
            codec,
            cache: (opts.cache_entries > 0)
                .then(|| RwLock::new(FrameCache::new(opts.cache_entries))),
            decode: Mutex::new(DecodeState {
                decoder,
                comp_buf: ScratchBuf::new(),
                discard: ScratchBuf::new(),
            }),
            pos: 0,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    /// Reads decompressed bytes starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes read. The returned count may be smaller
    /// than `buf.len()` when the requested range crosses an entry boundary;
    /// callers loop until the full range is read or `0` is returned, which
    /// marks the end of the archive. An `offset` at or beyond the
    /// decompressed size is not an error, it reads zero bytes.
    ///
    /// Safe to call concurrently from multiple threads.
    ///
    /// # Errors
    ///
    /// Fails if fetching or decompressing entry data fails. Errors leave the
    /// cache and codec state consistent.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let Some(loc) = self.seek_table.locate(offset) else {
            return Ok(0);
        };

        // Cap the read at the end of the owning entry
        let want = usize::try_from((loc.d_size - loc.offset_in_entry).min(buf.len() as u64))?;
        if want == 0 {
            return Ok(0);
        }
        let buf = &mut buf[..want];
        let in_entry = usize::try_from(loc.offset_in_entry)?;

        let Some(cache) = &self.cache else {
            // No cache: decompress directly into the caller's buffer,
            // discarding the prefix of the entry
            let mut decode = self.decode.lock();
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            decode.decode_into(&self.src, &loc, buf)?;
            return Ok(want);
        };

        {
            let cache = cache.read();
            if let Some(data) = cache.find(loc.index) {
                buf.copy_from_slice(&data[in_entry..in_entry + want]);
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                trace!(entry = loc.index, "cache hit");
                return Ok(want);
            }
        }

        // Miss. There is no lock upgrade; the shared lock is released, the
        // exclusive locks are taken and the lookup is repeated, because
        // another thread may have filled the entry in between.
        let mut decode = self.decode.lock();
        let mut cache_guard = cache.write();
        if let Some(data) = cache_guard.find(loc.index) {
            buf.copy_from_slice(&data[in_entry..in_entry + want]);
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(want);
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        trace!(entry = loc.index, "cache miss");
        let data = decode.decode_entry(&self.src, &loc)?;
        buf.copy_from_slice(&data[in_entry..in_entry + want]);
        let inserted = cache_guard.insert(loc.index, data);
        debug_assert!(inserted, "entry cannot appear while the write lock is held");

        Ok(want)
    }

    /// Reads decompressed bytes at the internal cursor into `buf`.
    ///
    /// Like [`Reader::pread`], but advances the cursor by the number of bytes
    /// returned.
    ///
    /// # Errors
    ///
    /// See [`Reader::pread`].
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.pread(buf, self.pos)?;
        self.pos += n as u64;

        Ok(n)
    }

    /// Moves the internal cursor used by [`Reader::read`].
    ///
    /// # Errors
    ///
    /// When the passed offset is beyond the decompressed size.
    pub fn set_offset(&mut self, offset: u64) -> Result<()> {
        if offset > self.seek_table.size_decomp() {
            return Err(Error::offset_out_of_range());
        }
        self.pos = offset;

        Ok(())
    }

    /// The current position of the internal cursor.
    pub fn offset(&self) -> u64 {
        self.pos
    }

    /// The codec of the archive, detected at open time unless a hint was
    /// given.
    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    /// Gets a reference to the parsed [`SeekTable`].
    pub fn seek_table(&self) -> &SeekTable {
        &self.seek_table
    }

    /// Observable counters of this reader.
    pub fn stats(&self) -> ReaderStats {
        // Lock order matters: the decompression state before the cache, like
        // the miss path of pread
        let decode = self.decode.lock();
        let buffer_size = decode.comp_buf.capacity() + decode.discard.capacity();
        let (cache_memory, cached_entries) = self.cache.as_ref().map_or((0, 0), |cache| {
            let cache = cache.read();
            (cache.memory_usage(), cache.len())
        });

        ReaderStats {
            entries: self.seek_table.num_entries(),
            size_decomp: self.seek_table.size_decomp(),
            seek_table_memory: self.seek_table.memory_usage(),
            cache_memory,
            cached_entries,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            buffer_size,
        }
    }
}

impl<S: SeekableSource> std::io::Read for Reader<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Reader::read(self, buf).map_err(std::io::Error::other)
    }
}

/// Allows to move the cursor of a `Reader` via seeking.
impl<S: SeekableSource> std::io::Seek for Reader<S> {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        use std::io::{self, SeekFrom};

        let offset = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::End(n) => self
                .seek_table
                .size_decomp()
                .checked_add_signed(n)
                .ok_or(io::Error::other(Error::offset_out_of_range()))?,
            SeekFrom::Current(n) => self
                .pos
                .checked_add_signed(n)
                .ok_or(io::Error::other(Error::offset_out_of_range()))?,
        };
        self.set_offset(offset).map_err(io::Error::other)?;

        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodecParams, Lz4Params, WriteOptions, ZstdParams};

    fn archive(data: &[u8], opts: WriteOptions) -> Vec<u8> {
        let mut sink = Vec::new();
        let mut writer = opts.into_writer(&mut sink).unwrap();
        writer.write(data).unwrap();
        writer.finish().unwrap();
        sink
    }

    // Reads the whole range starting at offset, looping over entry boundaries.
    fn pread_all<S: SeekableSource>(reader: &Reader<S>, mut offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        let mut progress = 0;
        while progress < len {
            let n = reader.pread(&mut out[progress..], offset).unwrap();
            if n == 0 {
                break;
            }
            progress += n;
            offset += n as u64;
        }
        out.truncate(progress);
        out
    }

    #[test]
    fn empty_archive() {
        let sink = archive(&[], WriteOptions::new());
        let reader = Reader::open(sink.as_slice()).unwrap();

        assert_eq!(reader.stats().size_decomp, 0);
        assert_eq!(reader.stats().entries, 0);
        let mut buf = [0u8; 1];
        assert_eq!(reader.pread(&mut buf, 0).unwrap(), 0);
    }

    #[test]
    fn single_tiny_frame() {
        let sink = archive(
            &[1, 2, 3, 4, 5],
            WriteOptions::new().min_frame_size(1 << 20),
        );
        let reader = Reader::open(sink.as_slice()).unwrap();
        assert_eq!(reader.stats().entries, 1);

        let mut buf = [0u8; 5];
        assert_eq!(reader.pread(&mut buf, 0).unwrap(), 5);
        assert_eq!(buf, [1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        assert_eq!(reader.pread(&mut buf, 1).unwrap(), 3);
        assert_eq!(buf, [2, 3, 4]);
    }

    #[test]
    fn cross_entry_read() {
        let sink = archive(
            &[0xAA; 10],
            WriteOptions::new().min_frame_size(4).frames_per_entry(1),
        );
        let reader = Reader::open(sink.as_slice()).unwrap();
        assert!(reader.stats().entries >= 2);

        // A single pread stops at the entry boundary
        let mut buf = [0u8; 10];
        let n = reader.pread(&mut buf, 0).unwrap();
        assert!(n < 10);

        let out = pread_all(&reader, 0, 10);
        assert_eq!(out, [0xAA; 10]);
    }

    #[test]
    fn out_of_range_read() {
        let sink = archive(&[7; 100], WriteOptions::new());
        let reader = Reader::open(sink.as_slice()).unwrap();
        let size = reader.stats().size_decomp;
        assert_eq!(size, 100);

        let mut buf = [0u8; 10];
        assert_eq!(reader.pread(&mut buf, size).unwrap(), 0);
        assert_eq!(reader.pread(&mut buf, size + 1).unwrap(), 0);
    }

    #[test]
    fn lz4_autodetect() {
        let data = b"autodetected lz4 archive contents".repeat(10);
        let sink = archive(
            &data,
            WriteOptions::new()
                .codec(CodecParams::Lz4(Lz4Params::new()))
                .min_frame_size(64)
                .frames_per_entry(2),
        );

        // No hint given; the codec comes from the frame magic
        let reader = Reader::open(sink.as_slice()).unwrap();
        assert_eq!(reader.codec(), CodecKind::Lz4);

        let out = pread_all(&reader, 0, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn codec_hint_overrides_detection() {
        let sink = archive(&[1; 50], WriteOptions::new());
        let reader = ReadOptions::new(sink.as_slice())
            .codec_hint(CodecKind::Zstd)
            .into_reader()
            .unwrap();
        assert_eq!(reader.codec(), CodecKind::Zstd);
    }

    #[test]
    fn unknown_magic_is_rejected() {
        // A valid trailer claiming one entry, preceded by garbage
        let mut st = crate::SeekTable::new();
        st.log_entry(4, 4, None).unwrap();
        let mut ser = st.into_serializer();
        let mut sink = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let mut buf = vec![0; ser.encoded_len()];
        ser.write_into(&mut buf);
        sink.extend_from_slice(&buf);

        assert!(
            Reader::open(sink.as_slice())
                .unwrap_err()
                .is_malformed()
        );
    }

    #[test]
    fn intra_entry_reads_discard_prefix() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4000).collect();
        // Several frames per entry force the discard path on unaligned reads
        let sink = archive(
            &data,
            WriteOptions::new().min_frame_size(128).frames_per_entry(5),
        );

        for cache_entries in [0, 4] {
            let reader = ReadOptions::new(sink.as_slice())
                .cache_entries(cache_entries)
                .into_reader()
                .unwrap();

            for offset in [0usize, 1, 127, 128, 640, 1920, 3333, 3999] {
                let out = pread_all(&reader, offset as u64, 100);
                let end = (offset + 100).min(data.len());
                assert_eq!(out, &data[offset..end], "offset {offset}");
            }
        }
    }

    #[test]
    fn cached_and_cacheless_readers_agree() {
        let data: Vec<u8> = (0..6000).map(|i| (i * 31 % 251) as u8).collect();
        let sink = archive(
            &data,
            WriteOptions::new().min_frame_size(256).frames_per_entry(3),
        );

        let cached = ReadOptions::new(sink.as_slice())
            .cache_entries(2)
            .into_reader()
            .unwrap();
        let cacheless = ReadOptions::new(sink.as_slice())
            .cache_entries(0)
            .into_reader()
            .unwrap();

        let mut state = 0x2545_F491u64;
        for _ in 0..500 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let offset = state % (data.len() as u64 + 10);
            let len = (state >> 32) as usize % 300;

            let a = pread_all(&cached, offset, len);
            let b = pread_all(&cacheless, offset, len);
            assert_eq!(a, b);

            let end = (offset as usize + len).min(data.len());
            let expected = if offset as usize >= data.len() {
                &[]
            } else {
                &data[offset as usize..end]
            };
            assert_eq!(a, expected);
        }

        assert!(cached.stats().cache_hits > 0);
        assert_eq!(cacheless.stats().cache_hits, 0);
        assert!(cacheless.stats().cache_memory == 0);
    }

    #[test]
    fn concurrent_readers_observe_consistent_bytes() {
        let data: Vec<u8> = (0..32_000).map(|i| (i * 131 % 257) as u8).collect();
        let sink = archive(
            &data,
            WriteOptions::new().min_frame_size(512).frames_per_entry(2),
        );
        let reader = ReadOptions::new(sink.as_slice())
            .cache_entries(3)
            .into_reader()
            .unwrap();

        std::thread::scope(|scope| {
            for seed in 1..=4u64 {
                let reader = &reader;
                let data = &data;
                scope.spawn(move || {
                    let mut state = seed;
                    let mut buf = vec![0; 600];
                    for _ in 0..1000 {
                        state = state
                            .wrapping_mul(6364136223846793005)
                            .wrapping_add(1442695040888963407);
                        let offset = state % (data.len() as u64 + 100);
                        let len = ((state >> 33) as usize % buf.len()) + 1;

                        let n = reader.pread(&mut buf[..len], offset).unwrap();
                        if offset >= data.len() as u64 {
                            assert_eq!(n, 0);
                        } else {
                            assert!(n > 0);
                            let start = offset as usize;
                            assert_eq!(&buf[..n], &data[start..start + n]);
                        }
                    }
                });
            }
        });

        // Out-of-range probes return early and don't count
        let stats = reader.stats();
        assert!(stats.cache_hits + stats.cache_misses >= 3900);
        assert!(stats.cached_entries <= 3);
    }

    #[test]
    fn cursor_reads_and_seeking() {
        use std::io::{Read, Seek, SeekFrom};

        let data = b"cursor based sequential reading".repeat(20);
        let sink = archive(&data, WriteOptions::new().min_frame_size(64));
        let mut reader = Reader::open(sink.as_slice()).unwrap();

        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(reader.offset(), data.len() as u64);

        reader.seek(SeekFrom::Start(7)).unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"based");

        reader.seek(SeekFrom::Current(-5)).unwrap();
        assert_eq!(reader.offset(), 7);

        reader.seek(SeekFrom::End(-4)).unwrap();
        let n = Reader::read(&mut reader, &mut buf).unwrap();
        assert_eq!(n, 4);

        assert!(reader.set_offset(data.len() as u64 + 1).is_err());
    }

    #[test]
    fn checksummed_archives_read_back() {
        let data = vec![0x42; 5000];
        let sink = archive(
            &data,
            WriteOptions::new()
                .min_frame_size(512)
                .frames_per_entry(2)
                .checksums(true),
        );
        let reader = Reader::open(sink.as_slice()).unwrap();
        assert!(reader.seek_table().has_checksums());

        let out = pread_all(&reader, 0, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn multi_worker_archives_read_back() {
        let data: Vec<u8> = (0..20_000).map(|i| (i % 256) as u8).collect();
        let mut sink = Vec::new();
        let mut writer = WriteOptions::new()
            .codec(CodecParams::Zstd(ZstdParams::new().nb_workers(2)))
            .min_frame_size(4096)
            .into_writer(&mut sink)
            .unwrap();
        writer.write(&data).unwrap();
        writer.finish().unwrap();

        let reader = Reader::open(sink.as_slice()).unwrap();
        let out = pread_all(&reader, 0, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn stats_reflect_cache_state() {
        let data = vec![9u8; 4096];
        let sink = archive(
            &data,
            WriteOptions::new().min_frame_size(512).frames_per_entry(1),
        );
        let reader = ReadOptions::new(sink.as_slice())
            .cache_entries(2)
            .into_reader()
            .unwrap();

        let mut buf = [0u8; 16];
        reader.pread(&mut buf, 0).unwrap();
        reader.pread(&mut buf, 0).unwrap();
        reader.pread(&mut buf, 1024).unwrap();

        let stats = reader.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 2);
        assert_eq!(stats.cached_entries, 2);
        assert_eq!(stats.cache_memory, 1024);
        assert_eq!(stats.entries, 8);
        assert_eq!(stats.size_decomp, 4096);
        assert!(stats.seek_table_memory > 0);
    }
}
