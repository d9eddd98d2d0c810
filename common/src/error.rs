//! Error taxonomy shared by every stage of a tree copy.

/// What class of failure an [`Error`] represents.
///
/// Callers branch on the kind, the attached context chain is for humans.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A path precondition failed: the source is missing or not a directory, or the destination
    /// exists and is not a directory.
    NotADirectory,
    /// The destination file or directory already exists, the engine never overwrites.
    Exists,
    /// Any open/read/write/stat/close/metadata failure not covered by other kinds.
    Io,
    /// Traversal of the source tree (or creating a destination directory) failed.
    Walk,
    /// The operation was cancelled before this piece of work completed.
    Cancelled,
    /// The destination is the source itself or lies inside it.
    NestedDestination,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NotADirectory => "not a directory",
            ErrorKind::Exists => "already exists",
            ErrorKind::Io => "I/O error",
            ErrorKind::Walk => "walk error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NestedDestination => "nested destination",
        };
        f.write_str(name)
    }
}

/// A classified error with its full context chain.
///
/// # Logging Convention
/// The Display implementation shows the full error chain, so any format specifier works:
/// ```ignore
/// tracing::error!("copy failed: {}", &error);
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    pub kind: ErrorKind,
    #[source]
    pub source: anyhow::Error,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, source: anyhow::Error) -> Self {
        Error { kind, source }
    }

    #[must_use]
    pub fn io(source: anyhow::Error) -> Self {
        Self::new(ErrorKind::Io, source)
    }

    #[must_use]
    pub fn walk(source: anyhow::Error) -> Self {
        Self::new(ErrorKind::Walk, source)
    }

    #[must_use]
    pub fn cancelled(path: &std::path::Path) -> Self {
        Self::new(
            ErrorKind::Cancelled,
            anyhow::anyhow!("operation cancelled before {:?} was done", path),
        )
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Maps a failed exclusive create onto [`ErrorKind::Exists`] and anything else onto `fallback`.
pub(crate) fn classify_create(error: &std::io::Error, fallback: ErrorKind) -> ErrorKind {
    if error.kind() == std::io::ErrorKind::AlreadyExists {
        ErrorKind::Exists
    } else {
        fallback
    }
}

/// Secondary problem reported next to the canonical error of a failed tree copy.
#[derive(Debug, thiserror::Error)]
pub enum Diagnostic {
    /// A failure ranked after the canonical one: a later-issued job, or a walk error that came
    /// after a failed job.
    #[error("{path:?} also failed: {error}")]
    SecondaryFailure {
        path: std::path::PathBuf,
        #[source]
        error: Error,
    },
    /// A best-effort removal that did not succeed, the path may still exist.
    #[error("cleanup of {path:?} failed: {error:#}")]
    CleanupFailure {
        path: std::path::PathBuf,
        #[source]
        error: anyhow::Error,
    },
}

impl Diagnostic {
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        match self {
            Diagnostic::SecondaryFailure { path, .. } => path,
            Diagnostic::CleanupFailure { path, .. } => path,
        }
    }
}
