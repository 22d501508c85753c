use std::fmt::Display;

/// EmberDB errors.
#[derive(Debug)]
pub enum Error {
    /// On-disk state failed a structural check: bad signature, short block,
    /// checksum mismatch, or an impossible offset.
    Corrupted(String),
    /// The database directory is locked by another process.
    Locked,
    /// The database handle has been closed.
    Closed,
    /// The store reached its maximum number of live entries.
    Full,
    /// Invalid user input, typically an unparsable topic or query.
    BadRequest(String),
    /// The topic exceeds the maximum encodable size.
    IdTooLarge,
    /// The payload exceeds the maximum encodable size.
    ValueTooLarge,
    /// An operation that requires a message id was given none.
    IdEmpty,
    /// The requested message id is not present.
    IdDoesNotExist,
    /// The iterator has been exhausted.
    IterationDone,
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corrupted(msg) => write!(f, "corrupted: {msg}"),
            Error::Locked => write!(f, "database is locked"),
            Error::Closed => write!(f, "database is closed"),
            Error::Full => write!(f, "database is full"),
            Error::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Error::IdTooLarge => write!(f, "topic is too large"),
            Error::ValueTooLarge => write!(f, "value is too large"),
            Error::IdEmpty => write!(f, "message id is empty"),
            Error::IdDoesNotExist => write!(f, "message id does not exist"),
            Error::IterationDone => write!(f, "iteration done"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::Corrupted for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupted(format!($($args)*)) };
}

/// Constructs an Error::BadRequest for the given format string.
#[macro_export]
macro_rules! errbadreq {
    ($($args:tt)*) => { $crate::error::Error::BadRequest(format!($($args)*)) };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corrupted(err.to_string())
    }
}
