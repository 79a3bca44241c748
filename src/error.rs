//! Contains the `Error` and `Result` types that `mongowatch` uses.

use std::{collections::HashSet, fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

/// Server error codes that indicate a change stream may be resumed against a
/// pre-4.4 server, which does not attach the resumable error label.
const RESUMABLE_CHANGE_STREAM_CODES: [i32; 17] = [
    6, 7, 89, 91, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436, 63, 150, 13388, 234, 133,
];
const INTERRUPTION_CODES: [i32; 2] = [11601, 237];

/// The server code for a cursor that no longer exists. Always resumable: the
/// cursor may simply have been reaped on a failed-over node.
const CURSOR_NOT_FOUND: i32 = 43;

/// Servers at or above this wire version communicate change stream
/// resumability through the error label rather than error codes.
const RESUMABLE_LABEL_MIN_WIRE_VERSION: i32 = 9;

/// Resumable change stream error label. Attached by 4.4+ servers to errors
/// from which a change stream may recover.
pub const RESUMABLE_CHANGE_STREAM_ERROR: &str = "ResumableChangeStreamError";
/// Label marking an error as terminal for change streams regardless of kind,
/// e.g. when the server has rotated its oplog past the resume point.
pub const NON_RESUMABLE_CHANGE_STREAM_ERROR: &str = "NonResumableChangeStreamError";

/// The result type for all methods that can return an error in the
/// `mongowatch` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongowatch` crate. The inner
/// [`ErrorKind`] is wrapped in a `Box` to allow the errors to be cheaply
/// moved; the whole error is `Clone` so it can be delivered to every waiter
/// observing a failed operation.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    pub(crate) wire_version: Option<i32>,
    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let labels = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        Self {
            kind: Box::new(kind),
            labels,
            wire_version: None,
            source: None,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn cursor_in_use(operation: &str) -> Error {
        ErrorKind::CursorInUse {
            message: format!(
                "cannot call {} on a cursor that has already been initialized",
                operation
            ),
        }
        .into()
    }

    /// Construct a generic network timeout error.
    #[cfg(test)]
    pub(crate) fn network_timeout() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    /// Adds the given label to this error.
    #[cfg(test)]
    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }

    pub(crate) fn with_wire_version(mut self, wire_version: i32) -> Self {
        self.wire_version = Some(wire_version);
        self
    }

    /// Gets the server error code from this error, if it carries one.
    pub(crate) fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            _ => None,
        }
        .or_else(|| self.source.as_ref().and_then(|s| s.code()))
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    /// Whether this error is a network timeout.
    pub fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }

    /// Whether the server killed or interrupted the operation this error came
    /// from. Covers the race between an in-flight getMore and a killCursors
    /// issued for the same cursor.
    pub(crate) fn is_interruption(&self) -> bool {
        match self.kind.as_ref() {
            ErrorKind::Command(err) => INTERRUPTION_CODES.contains(&err.code),
            ErrorKind::Io(io_err) => io_err.kind() == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Shutdown)
    }

    /// Whether a change stream that hit this error may transparently resume.
    ///
    /// Network failures are always candidates: the server side of the stream
    /// survives the loss of the client connection. Server-reported failures
    /// resume only when the server says so: through the
    /// `ResumableChangeStreamError` label on wire version 9+ servers, or
    /// through a fixed set of state-change error codes on older servers.
    /// Everything else (authentication, compatibility, invalid arguments,
    /// local shutdown, unclassified kinds) is terminal, as is any error the
    /// server explicitly labeled non-resumable.
    pub(crate) fn is_resumable(&self) -> bool {
        if self.contains_label(NON_RESUMABLE_CHANGE_STREAM_ERROR) {
            return false;
        }
        match self.kind.as_ref() {
            ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. } => true,
            ErrorKind::Command(command_error) => {
                if command_error.code == CURSOR_NOT_FOUND {
                    return true;
                }
                match self.wire_version {
                    Some(v) if v >= RESUMABLE_LABEL_MIN_WIRE_VERSION => {
                        self.contains_label(RESUMABLE_CHANGE_STREAM_ERROR)
                    }
                    Some(_) => RESUMABLE_CHANGE_STREAM_CODES.contains(&command_error.code),
                    None => false,
                }
            }
            _ => false,
        }
    }

}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<bson::document::ValueAccessError> for ErrorKind {
    fn from(err: bson::document::ValueAccessError) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// An error occurred while attempting to authenticate a connection.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(bson::ser::Error),

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection pool for a server was cleared during operation
    /// execution due to a concurrent error, causing the operation to fail.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    /// The server returned an invalid reply to a database operation.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// A server suitable for the operation could not be selected.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// An operation requiring a session was attempted on a deployment that
    /// does not support sessions.
    #[error("Attempted to start a session on a deployment that does not support sessions")]
    SessionsNotSupported,

    /// The server does not support the operation.
    #[error("The server does not support a database operation: {message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// No resume token was present in a change stream document.
    #[error("Cannot provide resume functionality when the resume token is missing")]
    MissingResumeToken,

    /// An operation was attempted on a closed change stream.
    #[error("The change stream has been closed")]
    ChangeStreamClosed,

    /// A change stream already consumed in one mode was used in the other.
    #[error("{message}")]
    #[non_exhaustive]
    ModeConflict { message: String },

    /// A cursor option was mutated after the cursor started executing.
    #[error("{message}")]
    #[non_exhaustive]
    CursorInUse { message: String },

    /// Iteration was attempted on a cursor that already reported exhaustion.
    #[error("Cannot advance a cursor whose server-side id has been exhausted")]
    CursorExhausted,

    /// An operation not supported by tailable cursors was attempted on one.
    #[error("{message}")]
    #[non_exhaustive]
    TailableCursor { message: String },

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// A method was called on a client that was shut down.
    #[error("Client has been shut down")]
    Shutdown,
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}
