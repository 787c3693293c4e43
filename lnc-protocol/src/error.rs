use core::fmt;

/// Error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    UnexpectedType(u16),
    /// Include the message type for trailing bytes
    TrailingBytes(usize, u16),
    ShortRead,
    MessageTooLarge,
    Eof,
    /// A field decoded to a value outside its domain
    InvalidValue(&'static str),
    Io(std::io::ErrorKind),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnexpectedType(t) => write!(f, "unexpected message type {}", t),
            Error::TrailingBytes(n, t) => {
                write!(f, "{} trailing bytes after message type {}", n, t)
            }
            Error::ShortRead => write!(f, "short read"),
            Error::MessageTooLarge => write!(f, "message too large"),
            Error::Eof => write!(f, "end of stream"),
            Error::InvalidValue(field) => write!(f, "invalid value for {}", field),
            Error::Io(kind) => write!(f, "i/o error: {:?}", kind),
        }
    }
}

impl std::error::Error for Error {}

/// Result
pub type Result<T> = core::result::Result<T, Error>;
