use std::time::Duration;

use log::{debug, warn};
use reqwest::Client;
use reqwest::header::USER_AGENT;
use serde::de::DeserializeOwned;

use crate::engine::models::{PatchManifest, ReleaseManifest};
use crate::error::{Result, UpdateError};
use crate::util::redact_url;

pub mod download;

pub use download::{DownloadController, DownloadManager, DownloadOutcome, DownloadRequest};

/// Small-document client for release metadata. Archives go through
/// [`DownloadManager`] instead.
#[derive(Clone)]
pub struct NetworkClient {
    client: Client,
}

impl NetworkClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }

    pub async fn fetch_release(&self, url: &str) -> Result<ReleaseManifest> {
        let release: ReleaseManifest = self.get_json(url).await?;
        if release.game.base_version.trim().is_empty() || release.game.full_url.trim().is_empty()
        {
            return Err(UpdateError::InvalidManifest(
                "release is missing the base game version or url".into(),
            ));
        }
        debug!(
            "network client: release base {} (launcher >= {})",
            release.game.base_version, release.minimum_launcher_version
        );
        Ok(release)
    }

    /// Fetch and validate the patch manifest.
    pub async fn fetch_patch_manifest(&self, url: &str) -> Result<PatchManifest> {
        let manifest: PatchManifest = self.get_json(url).await?;
        manifest.validate()?;
        debug!(
            "network client: patch manifest latest {} with {} patches",
            manifest.latest_version,
            manifest.patches.len()
        );
        Ok(manifest)
    }

    pub async fn fetch_patch_notes(&self, url: &str) -> Result<String> {
        self.get_text(url).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let body = self.get_text(url).await?;
        serde_json::from_str(&body).map_err(|e| {
            UpdateError::InvalidManifest(format!("{} is not valid: {e}", redact_url(url)))
        })
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let display_url = redact_url(url);
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, concat!("patchline/", env!("CARGO_PKG_VERSION")))
            .send()
            .await
            .map_err(|e| UpdateError::network(&display_url, format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::network(
                display_url,
                format!("unexpected HTTP status {status}"),
            ));
        }
        response
            .text()
            .await
            .map_err(|e| UpdateError::network(display_url, format!("failed to read body: {e}")))
    }
}

impl Default for NetworkClient {
    fn default() -> Self {
        Self::new()
    }
}
