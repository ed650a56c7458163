use std::path::PathBuf;
use std::time::Duration;

/// Minimum number of files a base-game extraction must produce.
pub const BASE_GAME_MIN_FILES: usize = 100;
/// Minimum number of files a patch extraction must produce.
pub const PATCH_MIN_FILES: usize = 1;

/// Retry, redirect and watchdog limits for a single download call.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub idle_timeout: Duration,
    pub max_redirects: usize,
    pub connect_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): 1s, 2s, 4s, ...
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(45),
            max_redirects: 10,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub release_url: Option<String>,
    pub launcher_version: String,
    pub retry: RetryPolicy,
    /// Minimum spacing between persisted download-progress writes.
    pub progress_persist_interval: Duration,
    pub base_game_min_files: usize,
    pub patch_min_files: usize,
    /// Paths, relative to the install directory, whose presence means game files exist.
    pub client_executables: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            release_url: None,
            launcher_version: env!("CARGO_PKG_VERSION").to_owned(),
            retry: RetryPolicy::default(),
            progress_persist_interval: Duration::from_secs(2),
            base_game_min_files: BASE_GAME_MIN_FILES,
            patch_min_files: PATCH_MIN_FILES,
            client_executables: default_client_executables(),
        }
    }
}

fn default_client_executables() -> Vec<PathBuf> {
    let client = PathBuf::from("Client");
    if cfg!(target_os = "windows") {
        vec![client.join("GameClient.exe"), PathBuf::from("GameClient.exe")]
    } else if cfg!(target_os = "macos") {
        vec![
            client
                .join("GameClient.app")
                .join("Contents")
                .join("MacOS")
                .join("GameClient"),
        ]
    } else {
        vec![client.join("GameClient"), PathBuf::from("GameClient")]
    }
}
