use std::{fs::File, io};

use crate::error::{Error, Result};

/// A source of compressed archive bytes that supports positional reads.
///
/// All methods take `&self`, so a single source can serve concurrent readers.
/// The reader never mutates the source; implementations must return stable
/// data for the lifetime of the reader.
pub trait SeekableSource {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning how many
    /// bytes were read. A return value of `0` means end of source.
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// The total size of the source in bytes.
    fn size(&self) -> io::Result<u64>;
}

impl SeekableSource for [u8] {
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= self.len() {
            return Ok(0);
        }

        let limit = buf.len().min(self.len() - offset);
        buf[..limit].copy_from_slice(&self[offset..offset + limit]);
        Ok(limit)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }
}

impl SeekableSource for File {
    #[cfg(unix)]
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl<S: SeekableSource + ?Sized> SeekableSource for &S {
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).pread(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        (**self).size()
    }
}

/// Fills `buf` completely from `src` at `offset`.
///
/// A source that reports end of data before `buf` is full is a short read.
pub(crate) fn read_exact_at<S: SeekableSource + ?Sized>(
    src: &S,
    mut buf: &mut [u8],
    mut offset: u64,
) -> Result<()> {
    while !buf.is_empty() {
        let n = src.pread(buf, offset)?;
        if n == 0 {
            return Err(Error::short_read());
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }

    Ok(())
}
