use zstd_safe::{ErrorCode, get_error_name};

/// A `Result` alias where the `Err` case is `seekarc::Error`.
pub type Result<T> = core::result::Result<T, Error>;

/// The errors that may occur when working with this crate.
#[derive(Debug)]
pub struct Error {
    kind: Kind,
}

impl Error {
    /// A custom error.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind: Kind::Other(err.into()),
        }
    }

    /// Returns true if the error cannot be categorized into any other kind.
    pub fn is_other(&self) -> bool {
        matches!(self.kind, Kind::Other(_))
    }

    /// Returns true if the error origins from a failed number conversion.
    pub fn is_number_conversion_failed(&self) -> bool {
        matches!(self.kind, Kind::NumberConversionFailed(_))
    }

    pub(crate) fn invalid_argument(reason: &'static str) -> Self {
        Self {
            kind: Kind::InvalidArgument(reason),
        }
    }

    /// Returns true if the error origins from an invalid argument or a handle in a terminal
    /// state.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self.kind, Kind::InvalidArgument(_))
    }

    pub(crate) fn offset_out_of_range() -> Self {
        Self {
            kind: Kind::OffsetOutOfRange,
        }
    }

    /// Returns true if the error origins from an out of range offset.
    pub fn is_offset_out_of_range(&self) -> bool {
        matches!(self.kind, Kind::OffsetOutOfRange)
    }

    pub(crate) fn entry_index_too_large() -> Self {
        Self {
            kind: Kind::EntryIndexTooLarge,
        }
    }

    /// Returns true if the error is related to a seek table entry index that is too large.
    pub fn is_entry_index_too_large(&self) -> bool {
        matches!(self.kind, Kind::EntryIndexTooLarge)
    }

    pub(crate) fn short_read() -> Self {
        Self {
            kind: Kind::ShortRead,
        }
    }

    /// Returns true if the error origins from an unexpected end of the source.
    pub fn is_short_read(&self) -> bool {
        matches!(self.kind, Kind::ShortRead)
    }

    pub(crate) fn malformed_trailer(reason: &'static str) -> Self {
        Self {
            kind: Kind::MalformedTrailer(reason),
        }
    }

    /// Returns true if the seek table trailer could not be parsed.
    pub fn is_malformed_trailer(&self) -> bool {
        matches!(self.kind, Kind::MalformedTrailer(_))
    }

    pub(crate) fn malformed(reason: &'static str) -> Self {
        Self {
            kind: Kind::Malformed(reason),
        }
    }

    /// Returns true if frame data is inconsistent with the seek table.
    pub fn is_malformed(&self) -> bool {
        matches!(self.kind, Kind::Malformed(_))
    }

    /// Returns true if the error origins from an IO error.
    pub fn is_io(&self) -> bool {
        matches!(self.kind, Kind::IO(_))
    }

    /// Returns true if the error origins from the zstd library.
    pub fn is_zstd(&self) -> bool {
        matches!(self.kind, Kind::Zstd(_))
    }

    /// Returns true if the error origins from the LZ4 frame codec.
    pub fn is_lz4(&self) -> bool {
        matches!(self.kind, Kind::Lz4(_))
    }

    /// Returns true if a codec reported a logical error.
    pub fn is_codec(&self) -> bool {
        self.is_zstd() || self.is_lz4()
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.kind {
            Kind::Other(err) => write!(f, "{err}"),
            Kind::NumberConversionFailed(err) => write!(f, "number conversion failed: {err}"),
            Kind::InvalidArgument(reason) => write!(f, "invalid argument: {reason}"),
            Kind::OffsetOutOfRange => f.write_str("offset out of range"),
            Kind::EntryIndexTooLarge => f.write_str("seek table entry index too large"),
            Kind::ShortRead => f.write_str("unexpected end of source"),
            Kind::MalformedTrailer(reason) => write!(f, "malformed seek table: {reason}"),
            Kind::Malformed(reason) => write!(f, "malformed archive: {reason}"),
            Kind::IO(err) => write!(f, "io error: {err}"),
            Kind::Zstd(code) => f.write_str(get_error_name(*code)),
            Kind::Lz4(err) => write!(f, "lz4 error: {err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<core::num::TryFromIntError> for Error {
    fn from(value: core::num::TryFromIntError) -> Self {
        Self {
            kind: Kind::NumberConversionFailed(value),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self {
            kind: Kind::IO(value),
        }
    }
}

impl From<ErrorCode> for Error {
    fn from(value: ErrorCode) -> Self {
        Self {
            kind: Kind::Zstd(value),
        }
    }
}

impl From<lz4_flex::frame::Error> for Error {
    fn from(value: lz4_flex::frame::Error) -> Self {
        Self {
            kind: Kind::Lz4(value),
        }
    }
}

enum Kind {
    Other(Box<dyn std::error::Error + Send + Sync>),
    /// Out of range integral type conversion attempted.
    NumberConversionFailed(core::num::TryFromIntError),
    /// A parameter is invalid or the handle is in a terminal state.
    InvalidArgument(&'static str),
    /// The desired offset is out of range.
    OffsetOutOfRange,
    /// The passed seek table entry index is too large.
    EntryIndexTooLarge,
    /// The source ended before the expected number of bytes was read.
    ShortRead,
    /// The seek table trailer is damaged.
    MalformedTrailer(&'static str),
    /// Frame data does not match the seek table.
    Malformed(&'static str),
    /// IO error.
    IO(std::io::Error),
    /// An error from the zstd library.
    Zstd(ErrorCode),
    /// An error from the LZ4 frame codec.
    Lz4(lz4_flex::frame::Error),
}

impl core::fmt::Debug for Kind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Other(arg0) => f.debug_tuple("Other").field(arg0).finish(),
            Self::NumberConversionFailed(arg0) => {
                f.debug_tuple("NumberConversionFailed").field(arg0).finish()
            }
            Self::InvalidArgument(reason) => {
                f.debug_tuple("InvalidArgument").field(reason).finish()
            }
            Self::OffsetOutOfRange => write!(f, "OffsetOutOfRange"),
            Self::EntryIndexTooLarge => write!(f, "EntryIndexTooLarge"),
            Self::ShortRead => write!(f, "ShortRead"),
            Self::MalformedTrailer(reason) => {
                f.debug_tuple("MalformedTrailer").field(reason).finish()
            }
            Self::Malformed(reason) => f.debug_tuple("Malformed").field(reason).finish(),
            Self::IO(arg0) => f.debug_tuple("IO").field(arg0).finish(),
            Self::Zstd(c) => write!(f, "{}; code {}", get_error_name(*c), c),
            Self::Lz4(arg0) => f.debug_tuple("Lz4").field(arg0).finish(),
        }
    }
}
