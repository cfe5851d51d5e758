use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// An exception raised by page code: the page function itself, an operation
/// handler, or a deferred-completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    pub message: String,
    /// Where the error was raised, e.g. `steps[3]` or `index.page:12`.
    pub location: Option<String>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        ScriptError {
            message: message.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{} (at {loc})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<OpError> for ScriptError {
    fn from(err: OpError) -> Self {
        ScriptError::new(err.to_string())
    }
}

/// errno-style classification of a failed filesystem operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotFound,
    AccessDenied,
    AlreadyExists,
    IsDirectory,
    NotDirectory,
    CrossDevice,
    NotPermitted,
    Io,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "ENOENT",
            ErrorCode::AccessDenied => "EACCES",
            ErrorCode::AlreadyExists => "EEXIST",
            ErrorCode::IsDirectory => "EISDIR",
            ErrorCode::NotDirectory => "ENOTDIR",
            ErrorCode::CrossDevice => "EXDEV",
            ErrorCode::NotPermitted => "EPERM",
            ErrorCode::Io => "EIO",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "no such file or directory",
            ErrorCode::AccessDenied => "permission denied",
            ErrorCode::AlreadyExists => "file already exists",
            ErrorCode::IsDirectory => "illegal operation on a directory",
            ErrorCode::NotDirectory => "not a directory",
            ErrorCode::CrossDevice => "cross-device link not permitted",
            ErrorCode::NotPermitted => "operation not permitted on executable file",
            ErrorCode::Io => "i/o error",
        }
    }

    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ErrorCode::NotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessDenied,
            io::ErrorKind::AlreadyExists => ErrorCode::AlreadyExists,
            io::ErrorKind::CrossesDevices => ErrorCode::CrossDevice,
            io::ErrorKind::NotADirectory => ErrorCode::NotDirectory,
            io::ErrorKind::IsADirectory => ErrorCode::IsDirectory,
            _ => ErrorCode::Io,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The failure outcome of one asynchronous operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {}, {syscall} '{}'", code.description(), path.display())]
pub struct OpError {
    pub code: ErrorCode,
    pub syscall: &'static str,
    pub path: PathBuf,
}

impl OpError {
    pub fn new(code: ErrorCode, syscall: &'static str, path: impl Into<PathBuf>) -> Self {
        OpError {
            code,
            syscall,
            path: path.into(),
        }
    }

    pub fn from_io(err: &io::Error, syscall: &'static str, path: &Path) -> Self {
        OpError::new(ErrorCode::from_io(err), syscall, path)
    }

    pub fn denied(syscall: &'static str, path: &Path) -> Self {
        OpError::new(ErrorCode::NotPermitted, syscall, path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("multipart body is missing a boundary parameter")]
    MissingBoundary,
    #[error("malformed multipart part headers: {0}")]
    BadPartHeaders(String),
    #[error("request body ended before the closing boundary")]
    UnexpectedEnd,
    #[error("request body read failed: {0}")]
    Read(#[source] io::Error),
    #[error("could not store uploaded file {}: {source}", path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("request body parsing was cancelled")]
    Cancelled,
}
