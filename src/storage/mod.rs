use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{Result, UpdateError};

pub mod schema;

pub use schema::{
    BaseGameState, DownloadProgress, GameState, NOT_INSTALLED, PatchState, SCHEMA_VERSION,
    StorageDocument, StoragePaths,
};

use schema::Decoded;

type ResetHook = Box<dyn Fn(&str) + Send + Sync>;

/// Owner of the persisted state document.
///
/// All reads and writes go through one async lock, so writes never interleave
/// and a read never observes a document mid-replacement. Assumes this process
/// is the only writer of the file.
pub struct StateStore {
    path: PathBuf,
    default_paths: StoragePaths,
    lock: Mutex<()>,
    reset_hook: Option<ResetHook>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, default_paths: StoragePaths) -> Self {
        Self {
            path: path.into(),
            default_paths,
            lock: Mutex::new(()),
            reset_hook: None,
        }
    }

    /// Register a callback told why the document had to be reset.
    #[must_use]
    pub fn with_reset_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.reset_hook = Some(Box::new(hook));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn default_document(&self) -> StorageDocument {
        StorageDocument::with_paths(self.default_paths.clone())
    }

    /// Load the document, migrating or resetting it as needed. Never fails.
    pub async fn read(&self) -> StorageDocument {
        let _guard = self.lock.lock().await;
        self.read_locked().await
    }

    pub async fn game_state(&self) -> GameState {
        self.read().await.game_state
    }

    /// Persist `document`, waiting for any write already in flight.
    pub async fn write(&self, document: &StorageDocument) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write_locked(document).await
    }

    /// Read-modify-write under the store lock; returns the document as written.
    pub async fn mutate<F>(&self, apply: F) -> Result<StorageDocument>
    where
        F: FnOnce(&mut StorageDocument),
    {
        let _guard = self.lock.lock().await;
        let mut document = self.read_locked().await;
        apply(&mut document);
        self.write_locked(&document).await?;
        Ok(document)
    }

    pub async fn mutate_game_state<F>(&self, apply: F) -> Result<GameState>
    where
        F: FnOnce(&mut GameState),
    {
        self.mutate(|doc| apply(&mut doc.game_state))
            .await
            .map(|doc| doc.game_state)
    }

    /// Record transfer progress, keeping the original start time of the record.
    pub async fn save_download_progress(&self, mut progress: DownloadProgress) -> Result<()> {
        self.mutate_game_state(|state| {
            if let Some(existing) = &state.download_progress
                && existing.url == progress.url
                && existing.destination_path == progress.destination_path
            {
                progress.started_at = existing.started_at;
            }
            progress.last_updated_at = Utc::now();
            state.download_progress = Some(progress);
        })
        .await
        .map(|_| ())
    }

    /// Overwrite the record of a running transfer. Leaves the state without a
    /// record, and returns false, once the record has been cleared.
    pub async fn refresh_download_progress(&self, progress: DownloadProgress) -> Result<bool> {
        let mut refreshed = false;
        self.mutate_game_state(|state| {
            if let Some(existing) = &mut state.download_progress
                && existing.url == progress.url
                && existing.destination_path == progress.destination_path
            {
                *existing = DownloadProgress {
                    started_at: existing.started_at,
                    last_updated_at: Utc::now(),
                    ..progress
                };
                refreshed = true;
            }
        })
        .await?;
        Ok(refreshed)
    }

    pub async fn clear_download_progress(&self) -> Result<Option<DownloadProgress>> {
        let mut removed = None;
        self.mutate_game_state(|state| removed = state.download_progress.take())
            .await?;
        Ok(removed)
    }

    pub async fn set_custom_install_dir(&self, dir: Option<PathBuf>) -> Result<StorageDocument> {
        self.mutate(|doc| {
            if let Some(dir) = &dir {
                doc.paths.install_path = dir.clone();
            } else {
                doc.paths.install_path = self.default_paths.install_path.clone();
            }
            doc.paths.custom_install_dir = dir;
        })
        .await
    }

    async fn read_locked(&self) -> StorageDocument {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(
                    "state_store: no state at {}, creating defaults",
                    self.path.display()
                );
                return self.persist_default().await;
            }
            Err(err) => {
                self.notify_reset(&format!("unreadable state file: {err}"));
                return self.persist_default().await;
            }
        };

        match schema::decode(&raw) {
            Decoded::Current(document) => document,
            Decoded::Migrated { document, from } => {
                info!(
                    "state_store: migrated schema {} -> {}",
                    from, document.schema_version
                );
                if let Err(err) = self.write_locked(&document).await {
                    error!("state_store: failed to persist migrated state: {err}");
                }
                document
            }
            Decoded::Invalid(reason) => {
                self.notify_reset(&reason);
                self.persist_default().await
            }
        }
    }

    async fn persist_default(&self) -> StorageDocument {
        let document = self.default_document();
        if let Err(err) = self.write_locked(&document).await {
            error!("state_store: failed to persist default state: {err}");
        }
        document
    }

    fn notify_reset(&self, reason: &str) {
        warn!(
            "state_store: resetting {} to defaults ({})",
            self.path.display(),
            reason
        );
        if let Some(hook) = &self.reset_hook {
            hook(reason);
        }
    }

    async fn write_locked(&self, document: &StorageDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|e| UpdateError::Storage(format!("failed to serialize state: {e}")))?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| UpdateError::io_at("create state directory", parent, e))?;
        }

        replace_file(&self.path, &bytes, |from, to| fs::rename(from, to)).await?;
        debug!("state_store: wrote {}", self.path.display());
        Ok(())
    }
}

/// Write `bytes` to a sibling temp file and `rename` it over `path`. Writes
/// `path` in place when the filesystem refuses the rename.
async fn replace_file<R, F>(path: &Path, bytes: &[u8], rename: R) -> Result<()>
where
    R: FnOnce(PathBuf, PathBuf) -> F,
    F: Future<Output = io::Result<()>>,
{
    let tmp = temp_path(path);
    fs::write(&tmp, bytes)
        .await
        .map_err(|e| UpdateError::io_at("write", &tmp, e))?;

    match rename(tmp.clone(), path.to_path_buf()).await {
        Ok(()) => Ok(()),
        Err(err) if rename_needs_fallback(&err) => {
            warn!(
                "state_store: atomic rename unsupported here ({err}); writing {} in place",
                path.display()
            );
            let _ = fs::remove_file(&tmp).await;
            fs::write(path, bytes)
                .await
                .map_err(|e| UpdateError::io_at("write", path, e))
        }
        Err(err) => {
            let _ = fs::remove_file(&tmp).await;
            Err(UpdateError::io_at("replace", path, err))
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Rename failures seen on filesystems that cannot replace files atomically.
fn rename_needs_fallback(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(
        err.kind(),
        PermissionDenied | CrossesDevices | StaleNetworkFileHandle | ResourceBusy
    ) {
        return true;
    }
    // ERROR_ACCESS_DENIED, ERROR_NOT_SAME_DEVICE, ERROR_SHARING_VIOLATION
    cfg!(windows) && matches!(err.raw_os_error(), Some(5 | 17 | 32))
}
