use std::{
    cmp::PartialEq,
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

use crate::Lsn;

/// The top-level result type for dealing with the transaction log.
pub type Result<T> = std::result::Result<T, Error>;

/// The ways a log page can fail validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageError {
    /// The page or file number stored in the header does not match the
    /// position the page was read from.
    PageMismatch,
    /// The header carries flag bits this log does not understand.
    BadFlags,
    /// The stored CRC32 does not match the page payload.
    CrcMismatch,
    /// A sector of the page was left over from an older write. The page
    /// was cut back to the chunks ending before it.
    SectorCorrupt {
        /// Offset of the first sector that missed the last write.
        torn_at: usize,
        /// Bytes of the page, header included, that are still valid.
        kept: usize,
        /// The rewrite counter of the write that was torn.
        write_counter: u8,
    },
}

impl Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::PageError::*;

        match *self {
            PageMismatch => write!(f, "page or file number mismatch"),
            BadFlags => write!(f, "unknown page flags"),
            CrcMismatch => write!(f, "page crc mismatch"),
            SectorCorrupt { torn_at, kept, .. } => {
                write!(f, "torn sector write at byte {}, {} bytes kept", torn_at, kept)
            }
        }
    }
}

/// An Error type encapsulating various issues that may come up
/// in both the expected and unexpected operation of a `Translog`.
#[derive(Debug)]
pub enum Error {
    /// The system has been used in an unsupported way.
    Unsupported(String),
    /// An unexpected bug has happened. Please open an issue on github!
    ReportableBug(String),
    /// A read or write error has happened when interacting with the file
    /// system.
    Io(io::Error),
    /// A page failed validation.
    BadPage {
        /// The address of the start of the page.
        at: Lsn,
        /// What was wrong with it.
        error: PageError,
    },
    /// Corruption has been detected in the log.
    Corruption {
        /// The log address that corrupted data was found at.
        at: Lsn,
        /// A description of the damage.
        reason: String,
    },
    /// The log was opened read-only.
    ReadOnly,
}

impl Error {
    pub(crate) fn corruption<R: Into<String>>(at: Lsn, reason: R) -> Error {
        Error::Corruption { at, reason: reason.into() }
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        use self::Error::*;

        match self {
            Io(ioe) => Io(io::Error::new(ioe.kind(), format!("{:?}", ioe))),
            Unsupported(why) => Unsupported(why.clone()),
            ReportableBug(what) => ReportableBug(what.clone()),
            BadPage { at, error } => BadPage { at: *at, error: *error },
            Corruption { at, reason } => {
                Corruption { at: *at, reason: reason.clone() }
            }
            ReadOnly => ReadOnly,
        }
    }
}

impl Eq for Error {}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use self::Error::*;

        match (self, other) {
            (Unsupported(l), Unsupported(r)) => l == r,
            (ReportableBug(l), ReportableBug(r)) => l == r,
            (
                BadPage { at: la, error: le },
                BadPage { at: ra, error: re },
            ) => la == ra && le == re,
            (
                Corruption { at: la, reason: lr },
                Corruption { at: ra, reason: rr },
            ) => la == ra && lr == rr,
            (ReadOnly, ReadOnly) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error)
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        use self::Error::*;

        match error {
            Io(ioe) => ioe,
            ReadOnly => {
                io::Error::new(io::ErrorKind::PermissionDenied, "log is read-only")
            }
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            Unsupported(ref e) => write!(f, "Unsupported: {}", e),
            ReportableBug(ref e) => write!(
                f,
                "Unexpected bug has happened: {}. \
                 PLEASE REPORT THIS BUG!",
                e
            ),
            Io(ref e) => write!(f, "IO error: {}", e),
            BadPage { at, error } => {
                write!(f, "Bad log page at {}: {}", at, error)
            }
            Corruption { at, ref reason } => {
                write!(f, "Read corrupted data at log address {}: {}", at, reason)
            }
            ReadOnly => write!(f, "The log is read-only"),
        }
    }
}
