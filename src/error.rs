use std::io;
use std::path::PathBuf;

/// Errors produced while compressing responses or maintaining the disk cache.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested path resolves outside the configured base directory.
    #[error("request path escapes the static base: {path}")]
    PathEscape {
        /// The path as requested.
        path: String,
    },

    /// The source file could not be stat'ed or opened.
    #[error("source not found: {}", path.display())]
    SourceNotFound {
        /// Resolved source path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// The compressor could not be constructed.
    #[error("cannot set up encoder: {0}")]
    EncodingSetup(String),

    /// A write to the client or a cache file failed mid-stream.
    #[error("partial write: {0}")]
    PartialWrite(#[source] io::Error),

    /// Creating, writing or renaming a cache artifact failed.
    #[error("cache I/O on {}: {source}", path.display())]
    CacheIo {
        /// Artifact or sidecar path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// Another writer is producing this artifact right now.
    #[error("artifact is being written: {}", path.display())]
    ArtifactBusy {
        /// Final artifact path.
        path: PathBuf,
    },
}

impl Error {
    pub(crate) fn cache_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::CacheIo {
            path: path.into(),
            source,
        }
    }

    /// Copies an I/O error so it can be both recorded and returned to a caller.
    pub(crate) fn partial_write(err: &io::Error) -> Self {
        Error::PartialWrite(io::Error::new(err.kind(), err.to_string()))
    }

    /// Returns true when the host should answer "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::SourceNotFound { .. })
    }

    /// Returns true when another writer already owns the artifact.
    pub fn is_artifact_busy(&self) -> bool {
        matches!(self, Error::ArtifactBusy { .. })
    }

    /// Returns true when the host should fall through to another handler.
    pub fn is_path_escape(&self) -> bool {
        matches!(self, Error::PathEscape { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_escape_display() {
        let err = Error::PathEscape {
            path: "../etc/passwd".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "request path escapes the static base: ../etc/passwd"
        );
        assert!(err.is_path_escape());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_partial_write_keeps_kind() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "client went away");
        let err = Error::partial_write(&io_err);
        match err {
            Error::PartialWrite(inner) => {
                assert_eq!(inner.kind(), io::ErrorKind::BrokenPipe);
                assert_eq!(inner.to_string(), "client went away");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
