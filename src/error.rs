use std::io::Error as IoError;
use std::io::ErrorKind as IoErrorKind;

use err_derive::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(display = "No header found")]
    NoHeader,
    #[error(display = "IO Error: {}", cause)]
    IoError { cause: IoError },
    #[error(display = "Unsupported MPQ version: {}", version)]
    UnsupportedVersion { version: u16 },
    #[error(display = "Corrupted archive: {}", reason)]
    Corrupted { reason: &'static str },
    #[error(display = "Sector {} failed its checksum", sector)]
    CorruptSector { sector: u32 },
    #[error(display = "File not found")]
    FileNotFound,
    #[error(display = "No more files")]
    NoMoreFiles,
    #[error(display = "File already exists")]
    AlreadyExists,
    #[error(display = "Access denied")]
    AccessDenied,
    #[error(display = "Invalid parameter: {}", reason)]
    InvalidParameter { reason: &'static str },
    #[error(display = "Seek before the beginning of the file")]
    InvalidSeek,
    #[error(display = "Expected {} bytes, got {}", expected, written)]
    SizeMismatch { expected: u64, written: u64 },
    #[error(display = "Hash table is full")]
    TableFull,
    #[error(display = "Buffer too small, {} bytes needed", needed)]
    InsufficientBuffer { needed: u64 },
    #[error(display = "Compression type unsupported: {}", kind)]
    UnsupportedCompression { kind: String },
    #[error(display = "Unsupported: {}", feature)]
    Unsupported { feature: &'static str },
}

/// The error taxonomy exposed at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    AccessDenied,
    InvalidParameter,
    TableFull,
    CorruptSector,
    CorruptHeader,
    InsufficientBuffer,
    Unsupported,
    IoFailure,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::FileNotFound | Error::NoMoreFiles => ErrorKind::NotFound,
            Error::AlreadyExists => ErrorKind::AlreadyExists,
            Error::AccessDenied => ErrorKind::AccessDenied,
            Error::InvalidParameter { .. } | Error::InvalidSeek | Error::SizeMismatch { .. } => {
                ErrorKind::InvalidParameter
            }
            Error::TableFull => ErrorKind::TableFull,
            Error::CorruptSector { .. } => ErrorKind::CorruptSector,
            Error::NoHeader | Error::Corrupted { .. } => ErrorKind::CorruptHeader,
            Error::InsufficientBuffer { .. } => ErrorKind::InsufficientBuffer,
            Error::UnsupportedVersion { .. }
            | Error::UnsupportedCompression { .. }
            | Error::Unsupported { .. } => ErrorKind::Unsupported,
            Error::IoError { .. } => ErrorKind::IoFailure,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn corrupted(reason: &'static str) -> Error {
        Error::Corrupted { reason }
    }
}

impl From<IoError> for Error {
    fn from(other: IoError) -> Self {
        // truncated reads inside the archive mean the archive lies about its layout
        if other.kind() == IoErrorKind::UnexpectedEof {
            return Error::corrupted("unexpected end of data");
        }

        Error::IoError { cause: other }
    }
}

impl From<Error> for IoError {
    fn from(other: Error) -> Self {
        let kind = match other.kind() {
            ErrorKind::NotFound => IoErrorKind::NotFound,
            ErrorKind::AlreadyExists => IoErrorKind::AlreadyExists,
            ErrorKind::AccessDenied => IoErrorKind::PermissionDenied,
            ErrorKind::InvalidParameter => IoErrorKind::InvalidInput,
            ErrorKind::CorruptSector | ErrorKind::CorruptHeader => IoErrorKind::InvalidData,
            _ => IoErrorKind::Other,
        };

        match other {
            Error::IoError { cause } => cause,
            other => IoError::new(kind, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_of_enumeration_is_not_found() {
        assert!(Error::NoMoreFiles.is_not_found());
        assert!(Error::FileNotFound.is_not_found());
        assert!(!Error::TableFull.is_not_found());
    }

    #[test]
    fn io_round_trip_keeps_kind() {
        let io: IoError = Error::InvalidSeek.into();
        assert_eq!(io.kind(), IoErrorKind::InvalidInput);

        let eof = IoError::new(IoErrorKind::UnexpectedEof, "short");
        assert_eq!(Error::from(eof).kind(), ErrorKind::CorruptHeader);
    }
}
