use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use reqwest::Url;
use tokio::fs;
use tokio::sync::{mpsc, watch};

use crate::checksum;
use crate::config::EngineConfig;
use crate::engine::models::{Patch, PatchManifest, RecoveryCandidate, ReleaseManifest};
use crate::engine::state::{
    BASE_GAME_TARGET, ChainOutcome, EngineEvent, InstallOutcome, PATCH_CHAIN_TARGET,
    UpdateReport, UpdateStage, UpdateStatus,
};
use crate::env::PathResolver;
use crate::error::{Result, UpdateError};
use crate::extract::{ArchiveKind, Extractor};
use crate::networking::{DownloadManager, DownloadRequest, NetworkClient};
use crate::storage::{DownloadProgress, GameState, StateStore};
use crate::updater;
use crate::util::{ProgressThrottle, redact_url};

pub mod models;
pub mod state;

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

/// Drives a client from its installed version to the latest published one.
pub struct PatchEngine {
    store: Arc<StateStore>,
    downloads: DownloadManager,
    extractor: Arc<dyn Extractor>,
    paths: Arc<dyn PathResolver>,
    network: NetworkClient,
    config: EngineConfig,
}

impl PatchEngine {
    pub fn new(
        store: Arc<StateStore>,
        paths: Arc<dyn PathResolver>,
        extractor: Arc<dyn Extractor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            downloads: DownloadManager::new(config.retry.clone()),
            extractor,
            paths,
            network: NetworkClient::new(),
            config,
        }
    }

    pub fn install_dir(&self) -> PathBuf {
        self.paths.install_dir()
    }

    pub async fn fetch_release(&self) -> Result<ReleaseManifest> {
        let url = self.config.release_url.as_deref().ok_or_else(|| {
            UpdateError::ConfigurationMissing("no release document URL configured".into())
        })?;
        self.network.fetch_release(url).await
    }

    pub async fn fetch_patch_manifest(&self, release: &ReleaseManifest) -> Result<PatchManifest> {
        self.network
            .fetch_patch_manifest(&release.patch_manifest_url)
            .await
    }

    pub async fn fetch_patch_notes(&self, release: &ReleaseManifest) -> Result<String> {
        self.network.fetch_patch_notes(&release.patch_notes_url).await
    }

    /// Fetch release metadata, install the base game if needed, then walk the patch chain.
    pub async fn run_update(&self, updates: &EventSender) -> Result<UpdateReport> {
        let release = self.fetch_release().await?;
        updater::ensure_launcher_compatible(
            &release.minimum_launcher_version,
            &self.config.launcher_version,
        )?;
        let manifest = self.fetch_patch_manifest(&release).await?;
        let install_dir = self.install_dir();

        let state = self.store.game_state().await;
        let base_game = if !state.is_installed() && !self.has_game_files(&install_dir) {
            let outcome = self
                .install_base_game(&release, &install_dir, updates)
                .await?;
            if outcome == InstallOutcome::Paused {
                return Ok(UpdateReport {
                    base_game: Some(outcome),
                    chain: None,
                });
            }
            Some(outcome)
        } else {
            None
        };

        let chain = self
            .apply_patch_chain(&manifest, &install_dir, updates)
            .await?;
        Ok(UpdateReport {
            base_game,
            chain: Some(chain),
        })
    }

    /// Where the client stands, without downloading anything.
    pub async fn check_status(
        &self,
        release: &ReleaseManifest,
        manifest: &PatchManifest,
    ) -> UpdateStatus {
        let state = self.store.game_state().await;
        if !state.is_installed() {
            return UpdateStatus::NotInstalled {
                base_version: release.game.base_version.clone(),
            };
        }
        let installed = state.installed_version;
        if installed == manifest.latest_version {
            return UpdateStatus::UpToDate { version: installed };
        }
        let chain: Vec<Patch> = manifest
            .chain_from(&installed)
            .into_iter()
            .cloned()
            .collect();
        if chain.is_empty() {
            UpdateStatus::Stalled {
                installed,
                latest: manifest.latest_version.clone(),
            }
        } else {
            UpdateStatus::PatchesAvailable { installed, chain }
        }
    }

    /// Download, verify and extract the full game archive.
    pub async fn install_base_game(
        &self,
        release: &ReleaseManifest,
        install_dir: &Path,
        updates: &EventSender,
    ) -> Result<InstallOutcome> {
        let state = self.store.game_state().await;
        if state.is_installed() {
            debug!(
                "install_base_game: already installed at {}",
                state.installed_version
            );
            return Ok(InstallOutcome::AlreadyInstalled {
                version: state.installed_version,
            });
        }

        info!(
            "install_base_game: installing {} into {}",
            release.game.base_version,
            install_dir.display()
        );
        let step = self
            .run_step(
                Artifact::BaseGame(release),
                install_dir,
                self.config.base_game_min_files,
                updates,
            )
            .await?;
        Ok(match step {
            StepOutcome::Applied => InstallOutcome::Installed {
                version: release.game.base_version.clone(),
            },
            StepOutcome::Paused => InstallOutcome::Paused,
        })
    }

    /// Apply patches until the installed version equals `latestVersion` or no
    /// patch starts at the installed version.
    ///
    /// `availableVersion` is persisted as the manifest's latest version on
    /// every exit, including errors.
    pub async fn apply_patch_chain(
        &self,
        manifest: &PatchManifest,
        install_dir: &Path,
        updates: &EventSender,
    ) -> Result<ChainOutcome> {
        let result = self.walk_chain(manifest, install_dir, updates).await;

        let latest = manifest.latest_version.clone();
        if let Err(err) = self
            .store
            .mutate_game_state(|state| state.available_version = latest)
            .await
        {
            error!("apply_patch_chain: failed to record available version: {err}");
            if result.is_ok() {
                return Err(err);
            }
        }
        result
    }

    /// Pause the running download. Returns whether one was running.
    pub fn pause_download(&self) -> bool {
        self.downloads.pause_active()
    }

    /// The persisted record of a paused or interrupted download, if any.
    pub async fn pending_download(&self) -> Option<DownloadProgress> {
        self.store.game_state().await.download_progress
    }

    /// Forget the resumable download and delete its partial file.
    pub async fn clear_download_progress(&self) -> Result<Option<DownloadProgress>> {
        if self.downloads.pause_active() {
            warn!("clear_download_progress: pausing the running download first");
        }
        let removed = self.store.clear_download_progress().await?;
        if let Some(progress) = &removed {
            info!(
                "clear_download_progress: discarding {} ({} bytes)",
                progress.destination_path.display(),
                progress.bytes_downloaded
            );
            remove_quietly(&progress.destination_path).await;
        }
        Ok(removed)
    }

    async fn walk_chain(
        &self,
        manifest: &PatchManifest,
        install_dir: &Path,
        updates: &EventSender,
    ) -> Result<ChainOutcome> {
        let state = self.store.game_state().await;
        let mut installed = if state.is_installed() {
            state.installed_version
        } else {
            self.recover_installed_version(manifest, install_dir)
                .await?
        };

        let mut applied = 0;
        let mut visited = HashSet::new();
        while installed != manifest.latest_version {
            if !visited.insert(installed.clone()) {
                return Err(UpdateError::PatchChainBroken(format!(
                    "patches loop back to {installed}"
                )));
            }
            let Some(patch) = manifest.next_patch(&installed) else {
                warn!(
                    "apply_patch_chain: no patch from {} toward {}; stopping",
                    installed, manifest.latest_version
                );
                updates
                    .send(EngineEvent::Stage {
                        target: PATCH_CHAIN_TARGET.into(),
                        stage: UpdateStage::Stalled {
                            version: installed.clone(),
                        },
                    })
                    .ok();
                return Ok(ChainOutcome::Stalled {
                    installed,
                    latest: manifest.latest_version.clone(),
                    applied,
                });
            };

            info!("apply_patch_chain: applying {}", patch.id());
            let step = self
                .run_step(
                    Artifact::Patch(patch),
                    install_dir,
                    self.config.patch_min_files,
                    updates,
                )
                .await?;
            match step {
                StepOutcome::Applied => {
                    installed = patch.to.clone();
                    applied += 1;
                }
                StepOutcome::Paused => {
                    return Ok(ChainOutcome::Paused {
                        patch: patch.id(),
                        applied,
                    });
                }
            }
        }

        if applied == 0 {
            info!("apply_patch_chain: already at {installed}");
            Ok(ChainOutcome::UpToDate { version: installed })
        } else {
            info!("apply_patch_chain: reached {installed} after {applied} patches");
            Ok(ChainOutcome::Completed {
                version: installed,
                applied,
            })
        }
    }

    /// Adopt an installed version for a client whose state was lost but whose files remain.
    async fn recover_installed_version(
        &self,
        manifest: &PatchManifest,
        install_dir: &Path,
    ) -> Result<String> {
        if !self.has_game_files(install_dir) {
            return Err(UpdateError::ConfigurationMissing(
                "no installed version recorded and no game files found; reinstall the game".into(),
            ));
        }
        let version = match manifest.recovery_candidate() {
            RecoveryCandidate::Found(version) => version,
            RecoveryCandidate::Ambiguous(candidates) => {
                return Err(UpdateError::ConfigurationMissing(format!(
                    "installed version unknown and the manifest has several starting points ({}); reapply patches manually",
                    candidates.join(", ")
                )));
            }
            RecoveryCandidate::None => {
                return Err(UpdateError::ConfigurationMissing(
                    "installed version unknown and no patch chain leads to the latest version; reapply patches manually".into(),
                ));
            }
        };

        warn!(
            "apply_patch_chain: installed version unknown but game files exist; assuming {version}"
        );
        self.store
            .mutate_game_state(|state| state.installed_version = version.clone())
            .await?;
        Ok(version)
    }

    fn has_game_files(&self, install_dir: &Path) -> bool {
        self.config
            .client_executables
            .iter()
            .any(|candidate| install_dir.join(candidate).exists())
    }

    async fn run_step(
        &self,
        artifact: Artifact<'_>,
        install_dir: &Path,
        min_files: usize,
        updates: &EventSender,
    ) -> Result<StepOutcome> {
        let mut step = StepTracker::new(artifact.target(), updates);
        let archive = self.paths.downloads_dir().join(artifact.archive_name());

        step.enter(UpdateStage::Downloading);
        match self.fetch_archive(&artifact, &archive, &step).await {
            Ok(Fetched::Ready) => {}
            Ok(Fetched::Paused) => {
                step.enter(UpdateStage::Idle);
                return Ok(StepOutcome::Paused);
            }
            Err(err) => return Err(step.fail(err)),
        }
        self.store
            .mutate_game_state(|state| artifact.mark_downloaded(state))
            .await
            .map_err(|err| step.fail(err))?;

        step.enter(UpdateStage::Verifying);
        if let Err(err) = checksum::ensure_sha256(&archive, artifact.sha256()).await {
            self.discard(&artifact, &archive).await;
            return Err(step.fail(err));
        }

        step.enter(UpdateStage::Extracting);
        let extracted = self
            .extractor
            .extract(&archive, install_dir, &|current: u64, total: u64| {
                step.progress("extract", current, total)
            })
            .await;
        if let Err(err) = extracted {
            self.discard(&artifact, &archive).await;
            return Err(step.fail(err));
        }

        step.enter(UpdateStage::VerifyingExtraction);
        let check = match self.extractor.verify_extracted(install_dir, min_files).await {
            Ok(check) => check,
            Err(err) => {
                self.discard(&artifact, &archive).await;
                return Err(step.fail(err));
            }
        };
        if !check.success {
            self.discard(&artifact, &archive).await;
            return Err(step.fail(UpdateError::ExtractionVerificationFailed {
                dir: install_dir.to_path_buf(),
                expected: min_files,
                found: check.file_count,
            }));
        }

        self.store
            .mutate_game_state(|state| artifact.mark_applied(state))
            .await
            .map_err(|err| step.fail(err))?;
        remove_quietly(&archive).await;
        step.enter(UpdateStage::Advanced {
            version: artifact.version().to_owned(),
        });
        step.enter(UpdateStage::Idle);
        Ok(StepOutcome::Applied)
    }

    /// Make the archive available locally, resuming a recorded partial download.
    async fn fetch_archive(
        &self,
        artifact: &Artifact<'_>,
        archive: &Path,
        step: &StepTracker<'_>,
    ) -> Result<Fetched> {
        let url = artifact.url();
        let pending = self
            .store
            .game_state()
            .await
            .download_progress
            .filter(|p| p.url == url && p.destination_path == archive);

        // Existence alone marks it downloaded; the checksum step catches stale leftovers.
        if pending.is_none() && fs::try_exists(archive).await.unwrap_or(false) {
            info!(
                "fetch_archive: {} already present at {}",
                step.target,
                archive.display()
            );
            return Ok(Fetched::Ready);
        }

        let resume_from = match &pending {
            Some(_) => file_len(archive).await,
            None => 0,
        };
        let now = Utc::now();
        let record = DownloadProgress {
            url: url.to_owned(),
            destination_path: archive.to_path_buf(),
            bytes_downloaded: resume_from,
            total_bytes: artifact.expected_size().unwrap_or(0),
            expected_hash: artifact.sha256().to_owned(),
            is_paused: false,
            started_at: now,
            last_updated_at: now,
        };
        self.store.save_download_progress(record.clone()).await?;
        info!(
            "fetch_archive: {} from {} (resume at {} bytes)",
            step.target,
            redact_url(url),
            resume_from
        );

        let request = DownloadRequest {
            url,
            destination: archive,
            resume_from,
            expected_size: artifact.expected_size(),
        };
        let (tick_tx, mut tick_rx) = watch::channel((resume_from, record.total_bytes));
        let interval = self.config.progress_persist_interval;

        let transfer = async move {
            let mut throttle = ProgressThrottle::new(interval);
            throttle.should_emit();
            let mut on_progress = |current: u64, total: u64| {
                step.progress("download", current, total);
                if throttle.should_emit() {
                    tick_tx.send_replace((current, total));
                }
            };
            self.downloads.download(request, &mut on_progress).await
        };
        let persist = async {
            while tick_rx.changed().await.is_ok() {
                let (current, total) = *tick_rx.borrow_and_update();
                let mut snapshot = record.clone();
                snapshot.bytes_downloaded = current;
                snapshot.total_bytes = total;
                if let Err(err) = self.store.refresh_download_progress(snapshot).await {
                    warn!("fetch_archive: failed to persist progress: {err}");
                }
            }
        };
        let (result, ()) = tokio::join!(transfer, persist);

        match result {
            Ok(outcome) if outcome.was_paused => {
                let mut snapshot = record;
                snapshot.bytes_downloaded = outcome.bytes_downloaded;
                if outcome.total_bytes > 0 {
                    snapshot.total_bytes = outcome.total_bytes;
                }
                snapshot.is_paused = true;
                if self.store.refresh_download_progress(snapshot).await? {
                    info!(
                        "fetch_archive: {} paused at {} bytes",
                        step.target, outcome.bytes_downloaded
                    );
                } else {
                    info!("fetch_archive: {} discarded while pausing", step.target);
                    remove_quietly(archive).await;
                }
                Ok(Fetched::Paused)
            }
            Ok(_) => {
                self.store.clear_download_progress().await?;
                Ok(Fetched::Ready)
            }
            Err(err) => {
                remove_quietly(archive).await;
                if let Err(clear_err) = self.store.clear_download_progress().await {
                    warn!("fetch_archive: failed to clear progress record: {clear_err}");
                }
                Err(err)
            }
        }
    }

    /// Delete a bad archive and revert its flags so the step restarts cleanly.
    async fn discard(&self, artifact: &Artifact<'_>, archive: &Path) {
        remove_quietly(archive).await;
        if let Err(err) = self
            .store
            .mutate_game_state(|state| artifact.revert(state))
            .await
        {
            error!(
                "discard: failed to revert state for {}: {err}",
                artifact.target()
            );
        }
    }
}

enum Fetched {
    Ready,
    Paused,
}

enum StepOutcome {
    Applied,
    Paused,
}

/// What one download-verify-extract step installs.
#[derive(Clone, Copy)]
enum Artifact<'a> {
    BaseGame(&'a ReleaseManifest),
    Patch(&'a Patch),
}

impl Artifact<'_> {
    fn target(&self) -> String {
        match self {
            Artifact::BaseGame(_) => BASE_GAME_TARGET.into(),
            Artifact::Patch(patch) => patch.id(),
        }
    }

    fn url(&self) -> &str {
        match self {
            Artifact::BaseGame(release) => &release.game.full_url,
            Artifact::Patch(patch) => &patch.full_url,
        }
    }

    fn sha256(&self) -> &str {
        match self {
            Artifact::BaseGame(release) => &release.game.sha256,
            Artifact::Patch(patch) => &patch.sha256,
        }
    }

    fn expected_size(&self) -> Option<u64> {
        match self {
            Artifact::BaseGame(release) => Some(release.game.size_bytes),
            Artifact::Patch(patch) => patch.size_bytes,
        }
    }

    /// Version the install is at once this artifact is applied.
    fn version(&self) -> &str {
        match self {
            Artifact::BaseGame(release) => &release.game.base_version,
            Artifact::Patch(patch) => &patch.to,
        }
    }

    fn archive_name(&self) -> String {
        let ext = archive_extension(self.url());
        match self {
            Artifact::BaseGame(release) => {
                format!("game_{}.{ext}", file_safe(&release.game.base_version))
            }
            Artifact::Patch(patch) => format!(
                "patch_{}_to_{}.{ext}",
                file_safe(&patch.from),
                file_safe(&patch.to)
            ),
        }
    }

    fn mark_downloaded(&self, state: &mut GameState) {
        match self {
            Artifact::BaseGame(_) => state.base_game.is_downloaded = true,
            Artifact::Patch(patch) => state.patches.downloaded_version = patch.to.clone(),
        }
    }

    fn revert(&self, state: &mut GameState) {
        match self {
            Artifact::BaseGame(_) => {
                state.base_game.is_downloaded = false;
                state.base_game.is_extracted = false;
            }
            Artifact::Patch(_) => {
                state.patches.downloaded_version = state.installed_version.clone();
            }
        }
    }

    fn mark_applied(&self, state: &mut GameState) {
        let version = self.version().to_owned();
        if let Artifact::BaseGame(_) = self {
            state.base_game.is_downloaded = true;
            state.base_game.is_extracted = true;
        }
        state.patches.downloaded_version = version.clone();
        state.patches.applied_version = version.clone();
        state.installed_version = version;
    }
}

/// Emits stage and progress events for one step and tracks its stage.
struct StepTracker<'a> {
    target: String,
    stage: UpdateStage,
    updates: &'a EventSender,
}

impl<'a> StepTracker<'a> {
    fn new(target: String, updates: &'a EventSender) -> Self {
        Self {
            target,
            stage: UpdateStage::Idle,
            updates,
        }
    }

    fn enter(&mut self, next: UpdateStage) {
        if !self.stage.can_transition_to(&next) {
            warn!(
                "step: unexpected transition {} -> {} for {}",
                self.stage.label(),
                next.label(),
                self.target
            );
        }
        debug!("step: {} -> {}", self.target, next.label());
        self.updates
            .send(EngineEvent::Stage {
                target: self.target.clone(),
                stage: next.clone(),
            })
            .ok();
        self.stage = next;
    }

    fn fail(&mut self, err: UpdateError) -> UpdateError {
        error!("step: {} failed during {}: {err}", self.target, self.stage.label());
        self.enter(UpdateStage::Failed {
            reason: err.to_string(),
        });
        err
    }

    fn progress(&self, stage: &'static str, current: u64, total: u64) {
        self.updates
            .send(EngineEvent::Progress {
                target: self.target.clone(),
                stage,
                current,
                total,
            })
            .ok();
    }
}

fn archive_extension(url: &str) -> &'static str {
    let path = Url::parse(url)
        .map(|parsed| parsed.path().to_owned())
        .unwrap_or_else(|_| url.to_owned());
    ArchiveKind::from_name(&path)
        .unwrap_or(ArchiveKind::Zip)
        .extension()
}

fn file_safe(version: &str) -> String {
    version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn file_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("cleanup: removed {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("cleanup: failed to remove {}: {err}", path.display()),
    }
}
