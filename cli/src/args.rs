use std::{path::PathBuf, str::FromStr};

use anyhow::bail;
use clap::Parser;
use seekarc::CompressionLevel;

#[derive(Debug, Clone)]
pub struct ByteValue(u32);

impl ByteValue {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl FromStr for ByteValue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, unit): (String, String) = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .partition(|c| c.is_ascii_digit());
        let value: u32 = value.parse()?;

        let value = match unit.as_str() {
            "B" | "" => value,
            "K" | "kib" => value * 1024,
            "M" | "mib" => value * 1024 * 1024,
            "G" | "gib" => value * 1024 * 1024 * 1024,
            _ => bail!("Unknown unit: {unit:?}"),
        };

        Ok(Self(value))
    }
}

#[derive(Debug, Clone)]
pub struct ByteOffset(u64);

impl ByteOffset {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for ByteOffset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let this = match s.to_lowercase().as_str() {
            "start" => Self(0),
            "end" => Self(u64::MAX),
            _ => Self(u64::from(ByteValue::from_str(s)?.as_u32())),
        };

        Ok(this)
    }
}

#[derive(Debug, Parser, Clone)]
pub struct CliFlags {
    /// Suppress output.
    #[arg(short, long, action, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Parser, Clone)]
pub struct SharedArgs {
    /// Disable output checks.
    #[arg(short, long, action, global = true)]
    pub force: bool,

    /// Write to STDOUT.
    #[arg(short = 'c', long, action, global = true)]
    pub stdout: bool,

    /// Do not show the progress counter.
    #[arg(long, action, global = true)]
    pub no_progress: bool,
}

#[derive(Debug, Parser, Clone)]
pub struct CompressArgs {
    #[clap(flatten)]
    pub shared: SharedArgs,

    /// Desired compression level. Lower numbers provide faster compression, higher numbers yield
    /// better compression ratios. Ignored with --lz4.
    #[arg(short = 'l', long, default_value_t = 3)]
    pub compression_level: CompressionLevel,

    /// Compress with LZ4 frames instead of Zstandard.
    #[arg(long, action)]
    pub lz4: bool,

    /// Record a checksum of the uncompressed data per seek table entry.
    #[arg(long, action)]
    pub checksums: bool,

    /// The uncompressed frame size at which to start a new frame. Accepts the suffixes K (kib),
    /// M (mib) and G (gib).
    #[arg(long, default_value = "2M")]
    pub frame_size: ByteValue,

    /// The number of frames that collapse into one seek table entry.
    #[arg(long, default_value_t = 10)]
    pub frames_per_entry: u32,

    /// The number of zstd worker threads. Zero compresses on the calling thread.
    #[arg(long, default_value_t = 0)]
    pub workers: u32,

    /// Input file.
    #[arg(default_value = "-")]
    pub input_file: PathBuf,

    /// Write data to the specified file.
    #[arg(short, long)]
    pub output_file: Option<PathBuf>,
}

#[derive(Debug, Parser, Clone)]
pub struct DecompressArgs {
    #[clap(flatten)]
    pub shared: SharedArgs,

    /// The offset (of the decompressed data) where decompression starts. Accepts the special
    /// values 'start' and 'end'.
    #[arg(long, default_value = "start")]
    pub from: ByteOffset,

    /// The offset (of the decompressed data) where decompression ends. Accepts the special
    /// values 'start' and 'end'.
    #[arg(long, default_value = "end")]
    pub to: ByteOffset,

    /// Input file.
    pub input_file: PathBuf,

    /// Write data to the specified file.
    #[arg(short, long)]
    pub output_file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Detailed listing of individual seek table entries.
    #[arg(short, long, action)]
    pub detail: bool,

    /// Input file.
    pub input_file: PathBuf,
}
