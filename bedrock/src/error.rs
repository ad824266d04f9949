use std::io;

/// Error taxonomy shared by the logger, the frame pool and the RPC server.
///
/// Medium-specific failures are folded down to their `io::ErrorKind` so the
/// variants stay `Copy` and comparable in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Out-of-range block, bad framing, wrong id/offset.
    InvalidArgument,
    /// The backing transport reported a zero payload size.
    NotConnected,
    /// Logger exhausted, pool empty, or staging full with no backend.
    NoMemory,
    /// The backend lacks the requested operation.
    NotSupported,
    /// The requested block is no longer (or not yet) present.
    NotFound,
    /// The logger is erasing; retry later.
    Busy,
    /// A blocking primitive expired.
    Timeout,
    /// The backing medium reported an error.
    Io(io::ErrorKind),
    /// The caller lacks the required authentication level.
    AccessDenied,
    /// Boot recovery found an unreconcilable wrap pattern.
    CorruptState,
}

impl Error {
    /// Negative errno-style code carried in RSP frames.
    #[inline]
    pub fn wire_code(self) -> i16 {
        match self {
            Error::InvalidArgument => -22,
            Error::NotConnected => -107,
            Error::NoMemory => -12,
            Error::NotSupported => -95,
            Error::NotFound => -2,
            Error::Busy => -16,
            Error::Timeout => -110,
            Error::Io(_) => -5,
            Error::AccessDenied => -13,
            Error::CorruptState => -22,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error.kind())
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_fold() {
        let err: Error = io::Error::from(io::ErrorKind::UnexpectedEof).into();

        assert_eq!(err, Error::Io(io::ErrorKind::UnexpectedEof));
        assert_eq!(err.wire_code(), -5);
    }

    #[test]
    fn test_wire_codes() {
        assert_eq!(Error::InvalidArgument.wire_code(), -22);
        assert_eq!(Error::AccessDenied.wire_code(), -13);
        assert_eq!(Error::Timeout.wire_code(), -110);
        assert_eq!(Error::NotSupported.wire_code(), -95);
    }
}
