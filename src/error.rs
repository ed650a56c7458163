use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failures surfaced by the update engine.
///
/// Display strings are stable: the classifier in [`crate::diagnostics`] falls
/// back to matching on them when it only sees the rendered text.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Non-2xx response, redirect limit, or transient failures that outlived the retry budget.
    #[error("network request failed for {url}: {message}")]
    NetworkFatal { url: String, message: String },

    #[error("size mismatch: expected {expected} bytes but server reported {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("extraction failed for {}: {message}", archive.display())]
    ExtractionFailed { archive: PathBuf, message: String },

    #[error(
        "extraction verification failed for {}: expected at least {expected} files, found {found}",
        dir.display()
    )]
    ExtractionVerificationFailed {
        dir: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("patch chain broken: {0}")]
    PatchChainBroken(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("launcher update required: version {current} is older than the minimum {required}")]
    LauncherOutdated { required: String, current: String },

    #[error("state file error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, UpdateError>;

impl UpdateError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap an I/O error with the path it concerned.
    pub fn io_at(action: &str, path: &Path, source: io::Error) -> Self {
        Self::io(format!("failed to {action} {}", path.display()), source)
    }

    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NetworkFatal {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_stable_messages() {
        let err = UpdateError::SizeMismatch {
            expected: 10,
            actual: 12,
        };
        assert_eq!(
            err.to_string(),
            "size mismatch: expected 10 bytes but server reported 12"
        );

        let err = UpdateError::io_at(
            "open",
            Path::new("/tmp/game.zip"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.to_string(), "failed to open /tmp/game.zip: gone");
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotFound));
    }
}
