use std::path::Path;

use log::{debug, warn};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{Result, UpdateError};

const READ_BUF: usize = 64 * 1024;

/// Stream a file through SHA-256 and return the lowercase hex digest.
///
/// A read failure is returned as [`UpdateError::Io`], distinct from a digest
/// that simply does not match.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .await
        .map_err(|e| UpdateError::io_at("open for checksum", path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let read = file
            .read(&mut buf)
            .await
            .map_err(|e| UpdateError::io_at("read for checksum", path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare a file's digest against `expected` (case-insensitive).
pub async fn verify_sha256(path: &Path, expected: &str) -> Result<bool> {
    let actual = sha256_file(path).await?;
    let matches = actual == expected.trim().to_lowercase();
    if matches {
        debug!("checksum: {} verified", path.display());
    } else {
        warn!(
            "checksum: mismatch for {} (expected {}, got {})",
            path.display(),
            expected,
            actual
        );
    }
    Ok(matches)
}

/// Like [`verify_sha256`] but turns a mismatch into [`UpdateError::ChecksumMismatch`].
pub async fn ensure_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path).await?;
    if actual != expected.trim().to_lowercase() {
        return Err(UpdateError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_owned(),
            actual,
        });
    }
    Ok(())
}
