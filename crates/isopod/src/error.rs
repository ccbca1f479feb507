use thiserror::Error;

/// Why a lookup operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupReason {
    NotFound,
    NotADirectory,
    IsADirectory,
}

impl std::fmt::Display for LookupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupReason::NotFound => write!(f, "not found"),
            LookupReason::NotADirectory => write!(f, "not a directory"),
            LookupReason::IsADirectory => write!(f, "is a directory"),
        }
    }
}

/// Error type for ISO 9660 operations.
///
/// Every variant corresponds to one of the error kinds an open/write/lookup
/// operation can fail with; there is no generic catch-all so callers can
/// always match on the reason.
#[derive(Debug, Error)]
pub enum Error {
    /// An on-disk invariant was violated: endian mismatch, a nonzero
    /// reserved byte, a bad identifier, a record straddling a block, etc.
    #[error("invalid ISO 9660 format in field `{field}`: {reason}")]
    Format { field: &'static str, reason: String },

    /// The session was not in the state an operation requires.
    #[error("invalid session state: expected {expected}, was {actual}")]
    State {
        expected: &'static str,
        actual: &'static str,
    },

    /// A path lookup failed.
    #[error("lookup failed for `{path}`: {reason}")]
    Lookup { path: String, reason: LookupReason },

    /// The caller supplied an obviously invalid argument.
    #[error("invalid argument: {message}")]
    Argument { message: String },

    /// The underlying byte stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn format(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Format {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn state(expected: &'static str, actual: &'static str) -> Self {
        Error::State { expected, actual }
    }

    pub(crate) fn lookup(path: impl Into<String>, reason: LookupReason) -> Self {
        Error::Lookup {
            path: path.into(),
            reason,
        }
    }

    pub(crate) fn argument(message: impl Into<String>) -> Self {
        Error::Argument {
            message: message.into(),
        }
    }
}
