//! Error taxonomy shared by every layer of the fabric: one flat `Error`
//! struct carrying a `kind` and a formatted description, raised through a
//! small macro so call sites read like `err!(Malformed, desc: "...", a,
//! b)?`.

use std::fmt;
use std::io;

/// Classifies every way the fabric can fail.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// A frame failed codec validation. Fatal to the owning session.
    Malformed,
    /// A frame violated a precondition of the sequencer's state machine.
    /// Fatal to the owning session.
    ProtocolViolation,
    /// A client-library call violated a local invariant. Reported
    /// synchronously to the caller; library state is left unchanged.
    Misuse,
    /// The transport signalled clean EOF.
    Closed,
    /// The underlying byte channel failed for a reason other than EOF.
    TransportError,
    /// An invariant internal to this crate was violated. Should never
    /// happen in a correct program; never panics a running server.
    Internal,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    desc: String,
}

impl Error {
    pub fn new(kind: ErrorKind, desc: impl Into<String>) -> Error {
        Error { kind, desc: desc.into() }
    }

    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Malformed
                | ErrorKind::ProtocolViolation
                | ErrorKind::Closed
                | ErrorKind::TransportError
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.desc)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => {
                Error::new(ErrorKind::Closed, err.to_string())
            }
            _ => Error::new(ErrorKind::TransportError, err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Constructs and returns an `Err(Error { .. })`.
macro_rules! err {
    ($kind:ident, desc: $($arg:tt)*) => {
        Err($crate::error::Error::new(
            $crate::error::ErrorKind::$kind,
            format!($($arg)*),
        ))
    };
}

pub(crate) use err;
