use tracing::debug;

use crate::{
    SEEK_TABLE_FOOTER_SIZE, SEEKABLE_MAGIC_NUMBER, SEEKABLE_MAX_FRAMES, SKIPPABLE_HEADER_SIZE,
    error::{Error, Result},
    io::{SeekableSource, read_exact_at},
};

// Reads 4 bytes (little endian) from buf starting at offset into an u32
macro_rules! read_le32 {
    ($buf:expr, $offset:expr) => {
        ($buf[$offset] as u32)
            | (($buf[$offset + 1] as u32) << 8)
            | (($buf[$offset + 2] as u32) << 16)
            | (($buf[$offset + 3] as u32) << 24)
    };
}

// Writes a 32 bit value in little endian to buf
macro_rules! write_le32 {
    ($buf:expr, $buf_pos:expr, $write_pos:expr, $value:expr, $offset:expr) => {
        // Only write if this hasn't been written before
        if $write_pos < $offset + 4 {
            // Minimum of remaining buffer space and number of bytes we want to write
            let len = usize::min($buf.len() - $buf_pos, $offset + 4 - $write_pos);
            // val_offset is > 0 if we wrote the value partially in a previous run (because of
            // little buffer space remaining)
            let val_offset = $write_pos - $offset;
            // Copy the important parts of value to buf
            $buf[$buf_pos..$buf_pos + len]
                .copy_from_slice(&$value.to_le_bytes()[val_offset..val_offset + len]);
            $buf_pos += len;
            $write_pos += len;
            // Return if the buffer is full
            if $buf_pos == $buf.len() {
                return $buf_pos;
            }
        }
    };
}

/// The maximum number of bytes read from the source per parse step.
const READ_CHUNK_SIZE: usize = 4096;
/// The skippable magic number of the skippable frame containing the seek table.
const SKIPPABLE_MAGIC_NUMBER: u32 = zstd_safe::zstd_sys::ZSTD_MAGIC_SKIPPABLE_START | 0xE;

struct EntryRecord {
    c_size: u32,
    d_size: u32,
    checksum: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    c_offset: u64,
    d_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entries(Vec<Entry>);

impl core::ops::Index<u32> for Entries {
    type Output = Entry;

    fn index(&self, index: u32) -> &Self::Output {
        let idx = usize::try_from(index).expect("Entry index can be transformed to usize");
        &self.0[idx]
    }
}

/// The position of a decompressed byte offset within the archive.
///
/// Returned by [`SeekTable::locate`]; describes the seek table entry that owns
/// the offset and where its compressed bytes live in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    /// The index of the owning seek table entry.
    pub index: u32,
    /// The offset into the decompressed data of the entry.
    pub offset_in_entry: u64,
    /// The start position of the compressed entry data in the source.
    pub c_offset: u64,
    /// The size of the compressed entry data.
    pub c_size: u64,
    /// The size of the decompressed entry data.
    pub d_size: u64,
}

#[derive(Debug)]
struct Parser {
    num_entries: u32,
    size_per_entry: usize,
    trailer_size: u64,
    entries: Entries,
    checksums: Option<Vec<u32>>,
    c_offset: u64,
    d_offset: u64,
}

impl Parser {
    fn from_footer(buf: &[u8; SEEK_TABLE_FOOTER_SIZE]) -> Result<Self> {
        if read_le32!(buf, 5) != SEEKABLE_MAGIC_NUMBER {
            return Err(Error::malformed_trailer("bad seek table magic"));
        }

        // Check reserved descriptor bits are not set
        if ((buf[4] >> 2) & 0x1f) > 0 {
            return Err(Error::malformed_trailer("reserved descriptor bits set"));
        }

        let with_checksum = (buf[4] & (1 << 7)) > 0;
        let num_entries = read_le32!(buf, 0);
        if num_entries > SEEKABLE_MAX_FRAMES {
            return Err(Error::entry_index_too_large());
        }

        let size_per_entry: usize = if with_checksum { 12 } else { 8 };
        let trailer_size = u64::from(num_entries) * size_per_entry as u64
            + (SKIPPABLE_HEADER_SIZE + SEEK_TABLE_FOOTER_SIZE) as u64;

        // Reserve the sentinel slot as well
        let cap = num_entries as usize + 1;
        Ok(Self {
            num_entries,
            size_per_entry,
            trailer_size,
            entries: Entries(Vec::with_capacity(cap)),
            checksums: with_checksum.then(|| Vec::with_capacity(num_entries as usize)),
            c_offset: 0,
            d_offset: 0,
        })
    }

    fn verify_skippable_header(&self, buf: &[u8; SKIPPABLE_HEADER_SIZE]) -> Result<()> {
        if read_le32!(buf, 0) != SKIPPABLE_MAGIC_NUMBER {
            return Err(Error::malformed_trailer("bad skippable frame magic"));
        }
        let size = u64::from(read_le32!(buf, 4));
        if size + SKIPPABLE_HEADER_SIZE as u64 != self.trailer_size {
            return Err(Error::malformed_trailer("skippable frame size mismatch"));
        }

        Ok(())
    }

    /// Parses entries from `buf`, which must hold a whole number of entries.
    fn parse_entries(&mut self, buf: &[u8]) {
        let mut pos = 0;
        while pos + self.size_per_entry <= buf.len() {
            self.log_offsets();
            self.c_offset += u64::from(read_le32!(buf, pos));
            self.d_offset += u64::from(read_le32!(buf, pos + 4));
            if let Some(checksums) = &mut self.checksums {
                checksums.push(read_le32!(buf, pos + 8));
            }
            pos += self.size_per_entry;
        }
    }

    fn log_offsets(&mut self) {
        self.entries.0.push(Entry {
            c_offset: self.c_offset,
            d_offset: self.d_offset,
        });
    }

    fn finish(mut self) -> SeekTable {
        // The sentinel entry marks the end of the last entry and carries the totals
        self.log_offsets();

        SeekTable {
            entries: self.entries,
            checksums: self.checksums,
        }
    }
}

/// Maps decompressed offsets to frame locations in a seekable archive.
///
/// The `SeekTable` is built up by the writer, serialized into a skippable
/// frame at the end of the archive and parsed again when a reader opens the
/// archive. One entry may cover several compressed frames, depending on the
/// writer's `frames_per_entry` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekTable {
    entries: Entries,
    checksums: Option<Vec<u32>>,
}

impl Default for SeekTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SeekTable {
    /// Create a new, empty seek table.
    pub fn new() -> Self {
        let entries = Entries(vec![Entry {
            c_offset: 0,
            d_offset: 0,
        }]);

        Self {
            entries,
            checksums: None,
        }
    }

    /// Parses the seek table trailer of a seekable archive.
    ///
    /// Reads the trailer with positional reads: the 9-byte footer first, then
    /// the skippable frame header, then the entries in chunks.
    ///
    /// # Errors
    ///
    /// Fails with a malformed trailer error when a magic number, a reserved
    /// descriptor bit or a size field doesn't verify, and with a short read
    /// error when the source ends early.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::fs::File;
    /// use seekarc::SeekTable;
    ///
    /// let archive = File::open("data.seek.zst")?;
    /// let seek_table = SeekTable::from_source(&archive)?;
    ///
    /// let num_entries = seek_table.num_entries();
    /// # Ok::<(), seekarc::Error>(())
    /// ```
    pub fn from_source<S: SeekableSource + ?Sized>(src: &S) -> Result<Self> {
        let size = src.size().map_err(Error::from)?;
        if size < (SKIPPABLE_HEADER_SIZE + SEEK_TABLE_FOOTER_SIZE) as u64 {
            return Err(Error::malformed_trailer("source too small for a seek table"));
        }

        let mut footer = [0u8; SEEK_TABLE_FOOTER_SIZE];
        read_exact_at(src, &mut footer, size - SEEK_TABLE_FOOTER_SIZE as u64)?;
        let mut parser = Parser::from_footer(&footer)?;

        if parser.trailer_size > size {
            return Err(Error::malformed_trailer("seek table larger than source"));
        }
        let trailer_start = size - parser.trailer_size;

        let mut header = [0u8; SKIPPABLE_HEADER_SIZE];
        read_exact_at(src, &mut header, trailer_start)?;
        parser.verify_skippable_header(&header)?;

        // Stream the entries in chunks holding a whole number of entries
        let chunk_entries = (READ_CHUNK_SIZE / parser.size_per_entry).max(1);
        let mut buf = vec![0u8; chunk_entries * parser.size_per_entry];
        let mut offset = trailer_start + SKIPPABLE_HEADER_SIZE as u64;
        let mut remaining = parser.num_entries as usize;
        while remaining > 0 {
            let take = remaining.min(chunk_entries);
            let len = take * parser.size_per_entry;
            read_exact_at(src, &mut buf[..len], offset)?;
            parser.parse_entries(&buf[..len]);
            offset += len as u64;
            remaining -= take;
        }

        debug!(
            num_entries = parser.num_entries,
            with_checksum = parser.checksums.is_some(),
            "parsed seek table"
        );

        Ok(parser.finish())
    }

    /// Adds an entry to this seek table.
    ///
    /// Whether `checksum` is present must be uniform across all entries of a
    /// table; the first logged entry decides.
    ///
    /// # Errors
    ///
    /// Fails if [`Self::num_entries()`] reaches [`SEEKABLE_MAX_FRAMES`] or
    /// checksum presence flips between entries.
    pub fn log_entry(&mut self, c_size: u32, d_size: u32, checksum: Option<u32>) -> Result<()> {
        if self.num_entries() >= SEEKABLE_MAX_FRAMES {
            return Err(Error::entry_index_too_large());
        }

        match (&mut self.checksums, checksum) {
            (Some(sums), Some(sum)) => sums.push(sum),
            (None, Some(sum)) if self.entries.0.len() == 1 => self.checksums = Some(vec![sum]),
            (None, None) => (),
            _ => {
                return Err(Error::invalid_argument(
                    "checksum presence must be uniform across entries",
                ));
            }
        }

        let last = &self.entries[self.num_entries()];
        self.entries.0.push(Entry {
            c_offset: last.c_offset + u64::from(c_size),
            d_offset: last.d_offset + u64::from(d_size),
        });

        Ok(())
    }

    /// The number of entries in the seek table.
    pub fn num_entries(&self) -> u32 {
        // Cast is always possible (max value SEEKABLE_MAX_FRAMES)
        (self.entries.0.len() - 1) as u32
    }

    /// Whether the entries carry checksums.
    pub fn has_checksums(&self) -> bool {
        self.checksums.is_some()
    }

    /// The checksum of entry `index`, if the table carries checksums.
    pub fn checksum(&self, index: u32) -> Option<u32> {
        let sums = self.checksums.as_ref()?;
        sums.get(index as usize).copied()
    }

    /// The entry index at the given decompressed offset.
    ///
    /// Offsets at or beyond the decompressed size map to the last entry.
    pub fn entry_index_decomp(&self, offset: u64) -> u32 {
        if offset >= self.size_decomp() {
            return self.num_entries().saturating_sub(1);
        }

        self.entry_index_at(offset)
    }

    /// Locates the entry that owns the decompressed byte at `offset`.
    ///
    /// Returns `None` if `offset` is at or beyond the decompressed size of
    /// the archive.
    pub fn locate(&self, offset: u64) -> Option<EntryLocation> {
        if offset >= self.size_decomp() {
            return None;
        }

        let index = self.entry_index_at(offset);
        let entry = &self.entries[index];
        let next = &self.entries[index + 1];

        Some(EntryLocation {
            index,
            offset_in_entry: offset - entry.d_offset,
            c_offset: entry.c_offset,
            c_size: next.c_offset - entry.c_offset,
            d_size: next.d_offset - entry.d_offset,
        })
    }

    /// The start position of entry `index` in the compressed data.
    ///
    /// # Errors
    ///
    /// Fails if the entry index is out of range.
    pub fn entry_start_comp(&self, index: u32) -> Result<u64> {
        if index >= self.num_entries() {
            return Err(Error::entry_index_too_large());
        }

        Ok(self.entries[index].c_offset)
    }

    /// The start position of entry `index` in the decompressed data.
    ///
    /// # Errors
    ///
    /// Fails if the entry index is out of range.
    pub fn entry_start_decomp(&self, index: u32) -> Result<u64> {
        if index >= self.num_entries() {
            return Err(Error::entry_index_too_large());
        }

        Ok(self.entries[index].d_offset)
    }

    /// The end position of entry `index` in the compressed data.
    ///
    /// # Errors
    ///
    /// Fails if the entry index is out of range.
    pub fn entry_end_comp(&self, index: u32) -> Result<u64> {
        if index >= self.num_entries() {
            return Err(Error::entry_index_too_large());
        }

        Ok(self.entries[index + 1].c_offset)
    }

    /// The end position of entry `index` in the decompressed data.
    ///
    /// # Errors
    ///
    /// Fails if the entry index is out of range.
    pub fn entry_end_decomp(&self, index: u32) -> Result<u64> {
        if index >= self.num_entries() {
            return Err(Error::entry_index_too_large());
        }

        Ok(self.entries[index + 1].d_offset)
    }

    /// The compressed size of entry `index`.
    ///
    /// # Errors
    ///
    /// Fails if the entry index is out of range.
    pub fn entry_size_comp(&self, index: u32) -> Result<u64> {
        if index >= self.num_entries() {
            return Err(Error::entry_index_too_large());
        }

        let size = self.entries[index + 1].c_offset - self.entries[index].c_offset;
        Ok(size)
    }

    /// The decompressed size of entry `index`.
    ///
    /// # Errors
    ///
    /// Fails if the entry index is out of range.
    pub fn entry_size_decomp(&self, index: u32) -> Result<u64> {
        if index >= self.num_entries() {
            return Err(Error::entry_index_too_large());
        }

        let size = self.entries[index + 1].d_offset - self.entries[index].d_offset;
        Ok(size)
    }

    /// The maximum decompressed entry size.
    #[allow(clippy::missing_panics_doc)]
    pub fn max_entry_size_decomp(&self) -> u64 {
        (0..self.num_entries())
            .map(|i| {
                self.entry_size_decomp(i)
                    .expect("Entry index is never out of range")
            })
            .max()
            .unwrap_or(0)
    }

    /// The compressed size of the archive, excluding the seek table itself.
    #[allow(clippy::missing_panics_doc)]
    pub fn size_comp(&self) -> u64 {
        self.entries
            .0
            .last()
            .expect("Seek table entries are never empty")
            .c_offset
    }

    /// The decompressed size of the archive.
    #[allow(clippy::missing_panics_doc)]
    pub fn size_decomp(&self) -> u64 {
        self.entries
            .0
            .last()
            .expect("Seek table entries are never empty")
            .d_offset
    }

    /// The approximate heap memory held by this seek table.
    pub fn memory_usage(&self) -> usize {
        let sums = self
            .checksums
            .as_ref()
            .map_or(0, |c| c.capacity() * size_of::<u32>());
        self.entries.0.capacity() * size_of::<Entry>() + sums
    }

    /// Convert this seek table into an immutable, serializable form.
    ///
    /// The serializer emits the trailer skippable frame that gets appended to
    /// a seekable archive.
    pub fn into_serializer(self) -> Serializer {
        let with_checksum = self.checksums.is_some();
        let checksums = self.checksums;
        let records = self
            .entries
            .0
            .windows(2)
            .enumerate()
            .map(|(i, w)| EntryRecord {
                c_size: (w[1].c_offset - w[0].c_offset) as u32,
                d_size: (w[1].d_offset - w[0].d_offset) as u32,
                checksum: checksums.as_ref().map_or(0, |c| c[i]),
            })
            .collect();

        Serializer {
            records,
            with_checksum,
            entry_index: 0,
            write_pos: 0,
        }
    }

    // Binary search for the greatest index whose decompressed start offset is <= offset. The
    // caller ensures that offset is within range.
    fn entry_index_at(&self, offset: u64) -> u32 {
        let mut low = 0;
        let mut high = self.num_entries();

        // low holds an index that starts at or before offset, high is beyond it
        while low + 1 < high {
            let mid = low.midpoint(high);
            if self.entries[mid].d_offset <= offset {
                low = mid;
            } else {
                high = mid;
            }
        }

        low
    }
}

/// A serializable, immutable form of a [`SeekTable`].
///
/// Serialization is resumable: [`Serializer::write_into`] fills output
/// windows of any size and continues where the previous call stopped.
///
/// # Examples
///
/// ```
/// use seekarc::SeekTable;
///
/// let mut seek_table = SeekTable::new();
/// seek_table.log_entry(123, 456, None)?;
/// seek_table.log_entry(333, 444, None)?;
///
/// let mut ser = seek_table.into_serializer();
/// let mut buf = vec![0; ser.encoded_len()];
///
/// let n = ser.write_into(&mut buf);
/// assert_eq!(n, ser.encoded_len());
///
/// # Ok::<(), seekarc::Error>(())
/// ```
pub struct Serializer {
    records: Vec<EntryRecord>,
    with_checksum: bool,
    entry_index: usize,
    write_pos: usize,
}

impl Serializer {
    /// Write the seek table into `buf`.
    ///
    /// Returns the number of bytes written. Call this repetitively until `0`
    /// is returned to serialize the entire seek table.
    pub fn write_into(&mut self, buf: &mut [u8]) -> usize {
        let size_per_entry = self.size_per_entry();
        let mut buf_pos = 0;

        // Write skippable header
        write_le32!(buf, buf_pos, self.write_pos, SKIPPABLE_MAGIC_NUMBER, 0);
        write_le32!(buf, buf_pos, self.write_pos, self.frame_size(), 4);

        // Write entries
        while self.entry_index < self.records.len() {
            let offset = SKIPPABLE_HEADER_SIZE + size_per_entry * self.entry_index;
            let record = &self.records[self.entry_index];
            write_le32!(buf, buf_pos, self.write_pos, record.c_size, offset);
            write_le32!(buf, buf_pos, self.write_pos, record.d_size, offset + 4);
            if self.with_checksum {
                write_le32!(buf, buf_pos, self.write_pos, record.checksum, offset + 8);
            }
            self.entry_index += 1;
        }

        // Write the footer after the entry data
        let offset = SKIPPABLE_HEADER_SIZE + size_per_entry * self.records.len();
        write_le32!(
            buf,
            buf_pos,
            self.write_pos,
            // Always fits in u32 because it cannot be greater than SEEKABLE_MAX_FRAMES
            self.records.len() as u32,
            offset
        );
        if self.write_pos < offset + 5 {
            buf[buf_pos] = if self.with_checksum { 1 << 7 } else { 0 };
            buf_pos += 1;
            self.write_pos += 1;
            if buf_pos == buf.len() {
                return buf_pos;
            }
        }
        write_le32!(
            buf,
            buf_pos,
            self.write_pos,
            SEEKABLE_MAGIC_NUMBER,
            offset + 5
        );

        buf_pos
    }

    /// Reset the serialization progress.
    ///
    /// Serialization starts from the beginning after this. Can be called at
    /// any time.
    pub fn reset(&mut self) {
        self.write_pos = 0;
        self.entry_index = 0;
    }

    /// The length of the entire trailer, including the skippable header and the footer.
    pub fn encoded_len(&self) -> usize {
        SKIPPABLE_HEADER_SIZE
            + self.records.len() * self.size_per_entry()
            + SEEK_TABLE_FOOTER_SIZE
    }

    fn size_per_entry(&self) -> usize {
        if self.with_checksum { 12 } else { 8 }
    }

    // The length of the seek table frame, not including the SKIPPABLE_MAGIC_NUMBER and
    // the size of the skippable frame. Always fits in u32.
    fn frame_size(&self) -> u32 {
        (self.encoded_len() - SKIPPABLE_HEADER_SIZE) as u32
    }
}

impl std::io::Read for Serializer {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(self.write_into(buf))
    }
}
