use std::{fmt, io};

/// Errors surfaced at the boundary where failure is exceptional rather than
/// ordinary control flow (on-disk I/O, corrupt persisted state).
///
/// The query layer does not use this type: `insert`/`update`/`delete` report
/// failure as `false`, `select` as an empty list, by design (see the crate's
/// `query` module docs) so that a `Transaction` can treat every operation
/// outcome uniformly.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Corrupt(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Corrupt(msg) => write!(f, "corrupt on-disk state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Corrupt(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
