use std::io::{Cursor, Read, Write};

use lz4_flex::frame::{BlockMode, BlockSize, FrameDecoder as Lz4FrameDecoder, FrameEncoder};
use zstd_safe::{
    CCtx, CParameter, CompressionLevel, DCtx, InBuffer, OutBuffer, ResetDirective,
    zstd_sys::{ZSTD_EndDirective, ZSTD_strategy},
};

use crate::{
    buffer::ScratchBuf,
    error::{Error, Result},
};

/// The magic number at the start of a Zstandard frame.
pub const ZSTD_FRAME_MAGIC: u32 = 0xFD2F_B528;
/// The magic number at the start of an LZ4 frame.
pub const LZ4_FRAME_MAGIC: u32 = 0x184D_2204;

/// The frame codec of a seekable archive.
///
/// All frames of one archive use the same codec; readers detect it from the
/// magic number of the first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// Zstandard frames.
    Zstd,
    /// LZ4 frames.
    Lz4,
}

impl CodecKind {
    pub(crate) fn detect(magic: u32) -> Result<Self> {
        match magic {
            ZSTD_FRAME_MAGIC => Ok(Self::Zstd),
            LZ4_FRAME_MAGIC => Ok(Self::Lz4),
            _ => Err(Error::malformed("unknown frame magic")),
        }
    }
}

/// The compression strategy used by the zstd match finder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZstdStrategy {
    Fast,
    Dfast,
    Greedy,
    Lazy,
    Lazy2,
    Btlazy2,
    Btopt,
    Btultra,
    Btultra2,
}

impl ZstdStrategy {
    fn to_zstd(self) -> ZSTD_strategy {
        match self {
            Self::Fast => ZSTD_strategy::ZSTD_fast,
            Self::Dfast => ZSTD_strategy::ZSTD_dfast,
            Self::Greedy => ZSTD_strategy::ZSTD_greedy,
            Self::Lazy => ZSTD_strategy::ZSTD_lazy,
            Self::Lazy2 => ZSTD_strategy::ZSTD_lazy2,
            Self::Btlazy2 => ZSTD_strategy::ZSTD_btlazy2,
            Self::Btopt => ZSTD_strategy::ZSTD_btopt,
            Self::Btultra => ZSTD_strategy::ZSTD_btultra,
            Self::Btultra2 => ZSTD_strategy::ZSTD_btultra2,
        }
    }
}

/// Parameters for Zstandard frame compression.
///
/// # Examples
///
/// Supports builder like chaining.
///
/// ```
/// use seekarc::ZstdParams;
///
/// let params = ZstdParams::new().compression_level(5).nb_workers(2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ZstdParams {
    compression_level: CompressionLevel,
    strategy: Option<ZstdStrategy>,
    nb_workers: u32,
    cpu_set: Option<Vec<usize>>,
}

impl ZstdParams {
    /// Creates parameters with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the compression level used by zstd.
    pub fn compression_level(mut self, level: CompressionLevel) -> Self {
        self.compression_level = level;
        self
    }

    /// Overrides the compression strategy chosen by the compression level.
    pub fn strategy(mut self, strategy: ZstdStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// The number of worker threads spawned by the codec. Zero compresses on
    /// the calling thread and selects the writer's buffered mode.
    pub fn nb_workers(mut self, nb_workers: u32) -> Self {
        self.nb_workers = nb_workers;
        self
    }

    /// Restricts worker pool creation to the given CPUs (linux only; ignored
    /// elsewhere). Only meaningful together with [`Self::nb_workers`].
    pub fn cpu_set(mut self, cpus: Vec<usize>) -> Self {
        self.cpu_set = Some(cpus);
        self
    }
}

/// The maximum LZ4 block size within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lz4BlockSize {
    #[default]
    Max64KiB,
    Max256KiB,
    Max1MiB,
    Max4MiB,
}

impl Lz4BlockSize {
    fn to_lz4(self) -> BlockSize {
        match self {
            Self::Max64KiB => BlockSize::Max64KB,
            Self::Max256KiB => BlockSize::Max256KB,
            Self::Max1MiB => BlockSize::Max1MB,
            Self::Max4MiB => BlockSize::Max4MB,
        }
    }
}

/// Parameters for LZ4 frame compression.
#[derive(Debug, Clone, Default)]
pub struct Lz4Params {
    block_size: Lz4BlockSize,
    block_checksums: bool,
    content_checksum: bool,
}

impl Lz4Params {
    /// Creates parameters with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum block size within a frame. Defaults to 64 KiB.
    pub fn block_size(mut self, block_size: Lz4BlockSize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Whether to append a checksum to every block.
    pub fn block_checksums(mut self, flag: bool) -> Self {
        self.block_checksums = flag;
        self
    }

    /// Whether to append a content checksum to every frame.
    pub fn content_checksum(mut self, flag: bool) -> Self {
        self.content_checksum = flag;
        self
    }

    // Frames must stay self-contained, so blocks are always independent.
    fn frame_info(&self) -> lz4_flex::frame::FrameInfo {
        lz4_flex::frame::FrameInfo::new()
            .block_size(self.block_size.to_lz4())
            .block_mode(BlockMode::Independent)
            .block_checksums(self.block_checksums)
            .content_checksum(self.content_checksum)
    }
}

/// Compression parameters, selecting the frame codec of the archive.
#[derive(Debug, Clone)]
pub enum CodecParams {
    /// Compress with Zstandard frames.
    Zstd(ZstdParams),
    /// Compress with LZ4 frames.
    Lz4(Lz4Params),
}

impl Default for CodecParams {
    fn default() -> Self {
        Self::Zstd(ZstdParams::default())
    }
}

impl From<ZstdParams> for CodecParams {
    fn from(value: ZstdParams) -> Self {
        Self::Zstd(value)
    }
}

impl From<Lz4Params> for CodecParams {
    fn from(value: Lz4Params) -> Self {
        Self::Lz4(value)
    }
}

impl CodecParams {
    /// The codec selected by these parameters.
    pub fn kind(&self) -> CodecKind {
        match self {
            Self::Zstd(_) => CodecKind::Zstd,
            Self::Lz4(_) => CodecKind::Lz4,
        }
    }
}

/// The writer side of the codec seam.
pub(crate) enum FrameCompressor {
    Zstd { cctx: CCtx<'static>, streaming: bool },
    Lz4 { params: Lz4Params },
}

impl std::fmt::Debug for FrameCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zstd { streaming, .. } => f
                .debug_struct("Zstd")
                .field("streaming", streaming)
                .finish_non_exhaustive(),
            Self::Lz4 { params } => f.debug_struct("Lz4").field("params", params).finish(),
        }
    }
}

impl FrameCompressor {
    pub(crate) fn new(params: &CodecParams) -> Result<Self> {
        match params {
            CodecParams::Zstd(p) => {
                let mut cctx = CCtx::try_create()
                    .ok_or_else(|| Error::other("failed to allocate compression context"))?;
                cctx.set_parameter(CParameter::CompressionLevel(p.compression_level))?;
                if let Some(strategy) = p.strategy {
                    cctx.set_parameter(CParameter::Strategy(strategy.to_zstd()))?;
                }
                if p.nb_workers > 0 {
                    cctx.set_parameter(CParameter::NbWorkers(p.nb_workers))?;
                    spawn_worker_pool(&mut cctx, p.cpu_set.as_deref())?;
                }

                Ok(Self::Zstd {
                    cctx,
                    streaming: p.nb_workers > 0,
                })
            }
            CodecParams::Lz4(p) => Ok(Self::Lz4 { params: p.clone() }),
        }
    }

    /// Whether input bytes stream through the codec instead of being buffered
    /// into whole frames first.
    pub(crate) fn is_streaming(&self) -> bool {
        match self {
            Self::Zstd { streaming, .. } => *streaming,
            Self::Lz4 { .. } => false,
        }
    }

    /// The recommended output chunk size for streaming compression.
    pub(crate) fn out_chunk_size(&self) -> usize {
        match self {
            Self::Zstd { .. } => CCtx::out_size(),
            Self::Lz4 { .. } => 64 * 1024,
        }
    }

    /// Compresses `data` into `out` as one complete frame, returning the
    /// compressed size.
    #[allow(clippy::missing_panics_doc)]
    pub(crate) fn compress_frame(&mut self, data: &[u8], out: &mut ScratchBuf) -> Result<usize> {
        match self {
            Self::Zstd { cctx, .. } => {
                // Sized by the codec's bound, so a single end pass always completes
                out.resize(zstd_safe::compress_bound(data.len()));
                let mut in_buf = InBuffer::around(data);
                let mut out_buf = OutBuffer::around(out.as_mut_slice());

                loop {
                    let n = cctx.compress_stream2(
                        &mut out_buf,
                        &mut in_buf,
                        ZSTD_EndDirective::ZSTD_e_end,
                    )?;
                    if n == 0 {
                        break;
                    }
                }

                let c_size = out_buf.pos();
                out.truncate(c_size);
                cctx.reset(ResetDirective::SessionOnly)
                    .expect("Resetting session never fails");

                Ok(c_size)
            }
            Self::Lz4 { params } => {
                out.reset();
                let mut enc = FrameEncoder::with_frame_info(params.frame_info(), out.as_mut_vec());
                enc.write_all(data).map_err(lz4_io_error)?;
                enc.finish()?;

                Ok(out.len())
            }
        }
    }

    /// Performs a streaming compression step from `input` to `out`.
    ///
    /// Returns how many bytes were consumed from `input` and written to
    /// `out`. Only supported by the zstd codec.
    pub(crate) fn stream_compress(&mut self, input: &[u8], out: &mut [u8]) -> Result<(usize, usize)> {
        let Self::Zstd { cctx, .. } = self else {
            return Err(Error::invalid_argument("streaming requires the zstd codec"));
        };

        let mut in_buf = InBuffer::around(input);
        let mut out_buf = OutBuffer::around(out);
        while in_buf.pos() < input.len() && out_buf.pos() < out_buf.capacity() {
            cctx.compress_stream2(
                &mut out_buf,
                &mut in_buf,
                ZSTD_EndDirective::ZSTD_e_continue,
            )?;
        }

        Ok((in_buf.pos(), out_buf.pos()))
    }

    /// Writes the epilogue of the current streamed frame into `out`.
    ///
    /// Returns the bytes written and a minimal estimation of the bytes left
    /// to flush; the frame is complete when the latter is zero.
    #[allow(clippy::missing_panics_doc)]
    pub(crate) fn stream_end_frame(&mut self, out: &mut [u8]) -> Result<(usize, usize)> {
        let Self::Zstd { cctx, .. } = self else {
            return Err(Error::invalid_argument("streaming requires the zstd codec"));
        };

        let mut empty_buf = InBuffer::around(&[]);
        let mut out_buf = OutBuffer::around(out);

        loop {
            let n = cctx.compress_stream2(
                &mut out_buf,
                &mut empty_buf,
                ZSTD_EndDirective::ZSTD_e_end,
            )?;

            if n == 0 {
                break;
            }

            if out_buf.pos() == out_buf.capacity() {
                // Indicate that more buffer space is required
                return Ok((out_buf.pos(), n));
            }
        }

        cctx.reset(ResetDirective::SessionOnly)
            .expect("Resetting session never fails");

        Ok((out_buf.pos(), 0))
    }
}

/// The reader side of the codec seam.
pub(crate) enum FrameDecoder {
    Zstd { dctx: DCtx<'static> },
    Lz4,
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zstd { .. } => f.debug_struct("Zstd").finish_non_exhaustive(),
            Self::Lz4 => f.debug_struct("Lz4").finish(),
        }
    }
}

impl FrameDecoder {
    pub(crate) fn new(kind: CodecKind) -> Result<Self> {
        match kind {
            CodecKind::Zstd => {
                let dctx = DCtx::try_create()
                    .ok_or_else(|| Error::other("failed to allocate decompression context"))?;
                Ok(Self::Zstd { dctx })
            }
            CodecKind::Lz4 => Ok(Self::Lz4),
        }
    }

    /// Decompresses one seek table entry from `comp`, skipping the first
    /// `skip` decompressed bytes and then filling `out` completely.
    ///
    /// An entry may contain several concatenated frames; the compressed bytes
    /// are never split up front, decoding continues into the next frame when
    /// the codec signals the end of the current one. Skipped bytes go through
    /// `discard`, a reusable workspace.
    ///
    /// # Errors
    ///
    /// Fails when the codec reports an error or `comp` runs out before
    /// `skip + out.len()` decompressed bytes were produced.
    pub(crate) fn decompress_entry(
        &mut self,
        comp: &[u8],
        skip: u64,
        out: &mut [u8],
        discard: &mut ScratchBuf,
    ) -> Result<usize> {
        match self {
            Self::Zstd { dctx } => Self::decompress_zstd(dctx, comp, skip, out, discard),
            Self::Lz4 => Self::decompress_lz4(comp, skip, out, discard),
        }
    }

    #[allow(clippy::missing_panics_doc)]
    fn decompress_zstd(
        dctx: &mut DCtx<'static>,
        comp: &[u8],
        skip: u64,
        out: &mut [u8],
        discard: &mut ScratchBuf,
    ) -> Result<usize> {
        // A previous early exit may have left the stream mid-frame
        dctx.reset(ResetDirective::SessionOnly)
            .expect("Resetting session never fails");

        let mut in_buf = InBuffer::around(comp);
        let mut skipped: u64 = 0;
        let mut written: usize = 0;

        while written < out.len() {
            if in_buf.pos() == comp.len() {
                return Err(Error::malformed("entry ends before its recorded size"));
            }

            let mut out_buf = if skipped < skip {
                // Dummy decompression until the requested offset is reached
                let limit = (skip - skipped).min(DCtx::out_size() as u64) as usize;
                discard.resize(limit);
                OutBuffer::around(&mut discard.as_mut_slice()[..limit])
            } else {
                OutBuffer::around(&mut out[written..])
            };

            while in_buf.pos() < comp.len() && out_buf.pos() < out_buf.capacity() {
                let prev_in = in_buf.pos();
                let prev_out = out_buf.pos();
                dctx.decompress_stream(&mut out_buf, &mut in_buf)?;
                if in_buf.pos() == prev_in && out_buf.pos() == prev_out {
                    return Err(Error::malformed("decompression makes no progress"));
                }
            }

            if skipped < skip {
                skipped += out_buf.pos() as u64;
            } else {
                written += out_buf.pos();
            }
        }

        Ok(written)
    }

    fn decompress_lz4(
        comp: &[u8],
        skip: u64,
        out: &mut [u8],
        discard: &mut ScratchBuf,
    ) -> Result<usize> {
        const DISCARD_CHUNK: usize = 64 * 1024;

        let mut cursor = Cursor::new(comp);
        let mut skipped: u64 = 0;
        let mut written: usize = 0;

        'entry: while written < out.len() {
            if cursor.position() as usize >= comp.len() {
                return Err(Error::malformed("entry ends before its recorded size"));
            }

            // A zero read means the end of the current frame; the next one
            // starts wherever this decoder stopped consuming.
            let mut dec = Lz4FrameDecoder::new(cursor);
            loop {
                if skipped < skip {
                    let limit = (skip - skipped).min(DISCARD_CHUNK as u64) as usize;
                    discard.resize(limit);
                    let n = dec
                        .read(&mut discard.as_mut_slice()[..limit])
                        .map_err(lz4_io_error)?;
                    if n == 0 {
                        break;
                    }
                    skipped += n as u64;
                } else {
                    let n = dec.read(&mut out[written..]).map_err(lz4_io_error)?;
                    if n == 0 {
                        break;
                    }
                    written += n;
                    if written == out.len() {
                        break 'entry;
                    }
                }
            }
            cursor = dec.into_inner();
        }

        Ok(written)
    }
}

fn spawn_worker_pool(cctx: &mut CCtx<'static>, cpu_set: Option<&[usize]>) -> Result<()> {
    #[cfg(target_os = "linux")]
    if let Some(cpus) = cpu_set {
        use nix::{
            sched::{CpuSet, sched_getaffinity, sched_setaffinity},
            unistd::Pid,
        };

        let pid = Pid::from_raw(0);
        let prev = sched_getaffinity(pid).map_err(Error::other)?;
        let mut set = CpuSet::new();
        for cpu in cpus {
            set.set(*cpu).map_err(Error::other)?;
        }
        sched_setaffinity(pid, &set).map_err(Error::other)?;

        // Thread creation inherits the calling thread's affinity, so the pool
        // has to spin up while the mask is applied
        let warmed = warmup(cctx);
        let restored = sched_setaffinity(pid, &prev).map_err(Error::other);
        warmed?;
        return restored;
    }

    #[cfg(not(target_os = "linux"))]
    let _ = cpu_set;

    warmup(cctx)
}

// A no-op compression call; the codec spins up its worker pool on first use.
#[allow(clippy::missing_panics_doc)]
fn warmup(cctx: &mut CCtx<'static>) -> Result<()> {
    let mut out = [0u8; 64];
    let mut in_buf = InBuffer::around(&[]);
    let mut out_buf = OutBuffer::around(&mut out);
    cctx.compress_stream2(
        &mut out_buf,
        &mut in_buf,
        ZSTD_EndDirective::ZSTD_e_continue,
    )?;
    cctx.reset(ResetDirective::SessionOnly)
        .expect("Resetting session never fails");

    Ok(())
}

pub(crate) fn lz4_io_error(err: std::io::Error) -> Error {
    let is_lz4 = err
        .get_ref()
        .is_some_and(|inner| inner.is::<lz4_flex::frame::Error>());

    if is_lz4 {
        let inner = err.into_inner().expect("inner error is present");
        let lz4 = inner
            .downcast::<lz4_flex::frame::Error>()
            .expect("inner error is an lz4 error");
        Error::from(*lz4)
    } else {
        Error::from(err)
    }
}
