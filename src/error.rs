//! Error and Result types for the transport core.

use std::error::Error as StdError;
use std::fmt;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Opaque error type returned by fallible operations in this crate.
///
/// The programmatically interesting information (why a connection dropped,
/// why a request failed) is carried separately as [`crate::message::ChangedReason`]
/// and [`crate::message::Status`]; this type exists for the plumbing-level
/// failures (I/O, protocol violations, internal bugs) that those closed
/// enums ultimately get mapped from.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The `h2` library reported a connection- or stream-level error.
    Http2,
    /// An I/O error occurred on the underlying transport socket.
    Io,
    /// A MIME part or JSON body could not be parsed.
    Parse,
    /// An attachment writer rejected a chunk outright (not backpressure).
    AttachmentWrite,
    /// A collaborator (auth delegate, attachment manager) returned an
    /// invalid value (empty token, etc).
    Collaborator,
    /// A bug in this crate's own state machine.
    Internal,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn is_internal(&self) -> bool {
        matches!(self.inner.kind, Kind::Internal)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            builder.field("cause", cause);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Http2 => f.write_str("http2 protocol error"),
            Kind::Io => f.write_str("i/o error"),
            Kind::Parse => f.write_str("error parsing response body"),
            Kind::AttachmentWrite => f.write_str("attachment writer rejected data"),
            Kind::Collaborator => f.write_str("collaborator returned an invalid value"),
            Kind::Internal => f.write_str("internal error"),
        }?;
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|c| &**c as _)
    }
}

impl From<h2::Error> for Error {
    fn from(err: h2::Error) -> Error {
        Error::new(Kind::Http2).with(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new(Kind::Io).with(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_cause() {
        let err = Error::new(Kind::Parse).with(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let s = err.to_string();
        assert!(s.contains("error parsing response body"));
        assert!(s.contains("boom"));
    }

    #[test]
    fn source_chains_to_cause() {
        let err = Error::new(Kind::Internal);
        assert!(StdError::source(&err).is_none());
    }
}
