use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    NotFound,
    Load,
    UnknownFormat,
    AlreadyExists,
    Closed,
    Busy,
    Job,
    Cancelled,
    Io,
}

impl ErrorKind {
    /// True when the failure is attributable to the request rather than the server.
    pub fn is_user_error(self) -> bool {
        matches!(
            self,
            ErrorKind::Usage
                | ErrorKind::NotFound
                | ErrorKind::Load
                | ErrorKind::UnknownFormat
                | ErrorKind::AlreadyExists
        )
    }
}

// Clone so a single load or job failure can be handed to every waiter.
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            source: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled).with_message("job was cancelled")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Re-wraps this error under another kind, keeping it as the source.
    pub fn wrap(self, kind: ErrorKind, message: impl Into<String>) -> Self {
        let path = self.path.clone();
        let mut err = Error::new(kind).with_message(message).with_source(self);
        err.path = path;
        err
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub(crate) fn map_io_error_kind(err: &std::io::Error) -> ErrorKind {
    match err.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        _ => ErrorKind::Io,
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::AlreadyExists => 4,
        ErrorKind::Busy => 5,
        ErrorKind::Load => 6,
        ErrorKind::UnknownFormat => 7,
        ErrorKind::Io => 8,
        ErrorKind::Job => 9,
        ErrorKind::Cancelled => 10,
        ErrorKind::Closed => 11,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, to_exit_code};
    use std::error::Error as _;

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::NotFound, 3),
            (ErrorKind::AlreadyExists, 4),
            (ErrorKind::Busy, 5),
            (ErrorKind::Load, 6),
            (ErrorKind::UnknownFormat, 7),
            (ErrorKind::Io, 8),
            (ErrorKind::Job, 9),
            (ErrorKind::Cancelled, 10),
            (ErrorKind::Closed, 11),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn clones_share_the_source() {
        let io = std::io::Error::other("disk gone");
        let err = Error::new(ErrorKind::Load)
            .with_message("failed to load level")
            .with_path("/w1")
            .with_source(io);
        let copy = err.clone();
        assert_eq!(copy.kind(), ErrorKind::Load);
        assert_eq!(copy.message(), Some("failed to load level"));
        assert_eq!(copy.to_string(), "Load: failed to load level (path: /w1)");
        assert_eq!(copy.source().map(|s| s.to_string()).as_deref(), Some("disk gone"));
    }

    #[test]
    fn wrap_keeps_path_and_inner_error() {
        let inner = Error::new(ErrorKind::Io)
            .with_message("short read")
            .with_path("/w1");
        let err = inner.wrap(ErrorKind::Job, "failed to copy partition");
        assert_eq!(err.kind(), ErrorKind::Job);
        assert_eq!(err.path().and_then(|p| p.to_str()), Some("/w1"));
        assert!(err.source().is_some());
    }

    #[test]
    fn user_errors_are_distinguished_from_server_failures() {
        assert!(ErrorKind::AlreadyExists.is_user_error());
        assert!(ErrorKind::UnknownFormat.is_user_error());
        assert!(ErrorKind::Load.is_user_error());
        assert!(!ErrorKind::Job.is_user_error());
        assert!(!ErrorKind::Io.is_user_error());
        assert!(!ErrorKind::Cancelled.is_user_error());
    }
}
