use std::{
    ffi::OsString,
    fs::File,
    io::{self, IsTerminal, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use seekarc::{CodecParams, Lz4Params, Reader, SeekTable, WriteOptions, ZstdParams};

use crate::args::{CliFlags, CompressArgs, DecompressArgs, ListArgs};

const ARCHIVE_EXTENSION: &str = "sza";
const COPY_BUF_SIZE: usize = 128 * 1024;

// HumanBytes can mess up indentation if not formatted
#[inline]
fn format_bytes(n: u64) -> String {
    format!("{}", HumanBytes(n))
}

#[derive(Debug, Subcommand)]
#[command(arg_required_else_help(true))]
pub enum Command {
    /// Compress INPUT_FILE (default); reads from STDIN if INPUT_FILE is `-` or not provided
    #[clap(alias = "c")]
    Compress(CompressArgs),
    /// Decompress a byte range of INPUT_FILE
    #[clap(alias = "d")]
    Decompress(DecompressArgs),
    /// Print information about seekable archives
    #[clap(alias = "l")]
    List(ListArgs),
}

impl Command {
    pub fn run(self, flags: &CliFlags) -> Result<()> {
        match self {
            Command::Compress(args) => compress(&args, flags),
            Command::Decompress(args) => decompress(&args, flags),
            Command::List(args) => list(&args),
        }
    }
}

fn compress(args: &CompressArgs, flags: &CliFlags) -> Result<()> {
    let is_stdin = args.input_file.as_os_str() == "-";
    let (mut input, input_len): (Box<dyn Read>, Option<u64>) = if is_stdin {
        (Box::new(io::stdin()), None)
    } else {
        let file = File::open(&args.input_file).context("Failed to open input file")?;
        let len = file.metadata().map(|m| m.len()).ok();
        (Box::new(file), len)
    };

    let out_path = if args.shared.stdout {
        None
    } else {
        args.output_file.clone().or_else(|| {
            (!is_stdin).then(|| default_compress_output(&args.input_file))
        })
    };
    let output = create_output(
        out_path.as_deref(),
        args.shared.force,
        !flags.quiet && !is_stdin,
    )?;

    let codec = if args.lz4 {
        CodecParams::Lz4(Lz4Params::new())
    } else {
        CodecParams::Zstd(
            ZstdParams::new()
                .compression_level(args.compression_level)
                .nb_workers(args.workers),
        )
    };
    let mut writer = WriteOptions::new()
        .codec(codec)
        .min_frame_size(args.frame_size.as_u32())
        .frames_per_entry(args.frames_per_entry)
        .checksums(args.checksums)
        .into_writer(output)
        .context("Failed to create writer")?;

    let bar = progress_bar(flags.quiet, args.shared.no_progress, input_len);
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut bytes_read: u64 = 0;
    loop {
        let n = input.read(&mut buf).context("Failed to read input")?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n]).context("Failed to compress data")?;
        bytes_read += n as u64;
        if let Some(bar) = &bar {
            bar.inc(n as u64);
        }
    }
    let bytes_written = writer.finish().context("Failed to finish archive")?;
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    if !flags.quiet && !args.shared.stdout {
        eprintln!(
            "{input_path} : {ratio:.2}% ( {read} => {written}, {output_path})",
            input_path = if is_stdin {
                "STDIN".into()
            } else {
                args.input_file.display().to_string()
            },
            ratio = if bytes_read == 0 {
                0.
            } else {
                100. / bytes_read as f64 * bytes_written as f64
            },
            read = HumanBytes(bytes_read),
            written = HumanBytes(bytes_written),
            output_path = out_path
                .as_deref()
                .map_or_else(|| "STDOUT".into(), |p| p.display().to_string()),
        );
    }

    Ok(())
}

fn decompress(args: &DecompressArgs, flags: &CliFlags) -> Result<()> {
    let file = File::open(&args.input_file).context("Failed to open input file")?;
    let reader = Reader::open(file).context("Failed to open archive")?;
    let size = reader.stats().size_decomp;

    let from = args.from.as_u64().min(size);
    let to = args.to.as_u64().min(size);
    if from > to {
        bail!("--from ({from}) is beyond --to ({to})");
    }

    let out_path = if args.shared.stdout {
        None
    } else {
        args.output_file
            .clone()
            .or_else(|| Some(args.input_file.with_extension("")))
    };
    let mut output = create_output(out_path.as_deref(), args.shared.force, !flags.quiet)?;

    let bar = progress_bar(flags.quiet, args.shared.no_progress, Some(to - from));
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut pos = from;
    while pos < to {
        let want = usize::try_from((to - pos).min(buf.len() as u64))?;
        let n = reader
            .pread(&mut buf[..want], pos)
            .context("Failed to read archive data")?;
        if n == 0 {
            break;
        }
        output
            .write_all(&buf[..n])
            .context("Failed to write decompressed data")?;
        pos += n as u64;
        if let Some(bar) = &bar {
            bar.inc(n as u64);
        }
    }
    output.flush()?;
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    if !flags.quiet && !args.shared.stdout {
        eprintln!("{} : {}", args.input_file.display(), HumanBytes(pos - from));
    }

    Ok(())
}

fn list(args: &ListArgs) -> Result<()> {
    let file = File::open(&args.input_file).context("Failed to open input file")?;
    let seek_table = SeekTable::from_source(&file).context("Failed to read seek table")?;

    if args.detail {
        list_entries(&seek_table)?;
    } else {
        summarize(&seek_table, &args.input_file);
    }

    Ok(())
}

fn summarize(seek_table: &SeekTable, path: &Path) {
    let compressed = seek_table.size_comp();
    let decompressed = seek_table.size_decomp();
    let ratio = if compressed == 0 {
        0.
    } else {
        decompressed as f64 / compressed as f64
    };

    println!(
        "{: <10} {: <15} {: <15} {: <15} {: <10} {: <10} {: <15}",
        "Entries", "Compressed", "Decompressed", "Max Entry Size", "Ratio", "Checksums", "Filename"
    );
    println!(
        "{: <10} {: <15} {: <15} {: <15} {: <10.3} {: <10} {: <15}",
        seek_table.num_entries(),
        format_bytes(compressed),
        format_bytes(decompressed),
        format_bytes(seek_table.max_entry_size_decomp()),
        ratio,
        if seek_table.has_checksums() { "yes" } else { "no" },
        path.display(),
    );
}

fn list_entries(seek_table: &SeekTable) -> Result<()> {
    println!(
        "{: <10} {: <15} {: <15} {: <20} {: <20} {: <10}",
        "Entry", "Compressed", "Decompressed", "Compressed Offset", "Decompressed Offset", "Checksum"
    );
    for n in 0..seek_table.num_entries() {
        let err_context = || format!("Failed to get data of entry {n}");
        println!(
            "{: <10} {: <15} {: <15} {: <20} {: <20} {: <10}",
            n,
            format_bytes(seek_table.entry_size_comp(n).with_context(err_context)?),
            format_bytes(seek_table.entry_size_decomp(n).with_context(err_context)?),
            seek_table.entry_start_comp(n).with_context(err_context)?,
            seek_table.entry_start_decomp(n).with_context(err_context)?,
            seek_table
                .checksum(n)
                .map_or_else(|| "-".into(), |c| format!("{c:08x}")),
        );
    }

    Ok(())
}

fn default_compress_output(input: &Path) -> PathBuf {
    // TODO: Use `add_extension` when stable: https://github.com/rust-lang/rust/issues/127292
    let extension = input.extension().map_or_else(
        || OsString::from(ARCHIVE_EXTENSION),
        |e| {
            let mut ext = OsString::from(e);
            ext.push(".");
            ext.push(ARCHIVE_EXTENSION);
            ext
        },
    );

    input.with_extension(extension)
}

fn create_output(path: Option<&Path>, force: bool, interactive: bool) -> Result<Box<dyn Write>> {
    match path {
        Some(path) => {
            if !force && path.exists() {
                if !interactive {
                    bail!("{} already exists; not overwritten", path.display());
                }

                eprint!("{} already exists; overwrite (y/n) ? ", path.display());
                io::stderr().flush()?;
                let mut buf = String::new();
                io::stdin()
                    .read_line(&mut buf)
                    .context("Failed to read stdin")?;
                if buf.trim_end() != "y" {
                    bail!("{} already exists", path.display());
                }
            }
            let file = File::create(path).context("Failed to create output file")?;

            Ok(Box::new(file))
        }
        None => {
            let stdout = io::stdout();
            if !force && stdout.is_terminal() {
                bail!("stdout is a terminal, aborting");
            }

            Ok(Box::new(stdout))
        }
    }
}

fn progress_bar(quiet: bool, no_progress: bool, len: Option<u64>) -> Option<ProgressBar> {
    (!quiet && !no_progress).then(|| {
        ProgressBar::with_draw_target(len, ProgressDrawTarget::stderr_with_hz(5)).with_style(
            ProgressStyle::with_template("{binary_bytes} of {binary_total_bytes}")
                .expect("Static template always works"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_appends_archive_extension() {
        assert_eq!(
            default_compress_output(Path::new("data.txt")),
            PathBuf::from("data.txt.sza")
        );
        assert_eq!(
            default_compress_output(Path::new("data")),
            PathBuf::from("data.sza")
        );
    }
}
