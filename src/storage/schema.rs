use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SCHEMA_VERSION: u32 = 2;

/// Installed-version sentinel for "nothing installed yet".
pub const NOT_INSTALLED: &str = "0.0.0";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDocument {
    pub schema_version: u32,
    pub paths: StoragePaths,
    pub game_state: GameState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePaths {
    pub install_path: PathBuf,
    pub download_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_install_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub installed_version: String,
    pub available_version: String,
    pub base_game: BaseGameState,
    pub patches: PatchState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<DownloadProgress>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseGameState {
    pub is_downloaded: bool,
    pub is_extracted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchState {
    pub downloaded_version: String,
    pub applied_version: String,
}

/// Resumable-transfer bookkeeping; present only while a download is active or paused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub url: String,
    pub destination_path: PathBuf,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub expected_hash: String,
    pub is_paused: bool,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl GameState {
    pub fn is_installed(&self) -> bool {
        self.installed_version != NOT_INSTALLED
    }
}

impl Default for GameState {
    fn default() -> Self {
        Self {
            installed_version: NOT_INSTALLED.into(),
            available_version: NOT_INSTALLED.into(),
            base_game: BaseGameState::default(),
            patches: PatchState {
                downloaded_version: NOT_INSTALLED.into(),
                applied_version: NOT_INSTALLED.into(),
            },
            download_progress: None,
        }
    }
}

impl StorageDocument {
    pub fn with_paths(paths: StoragePaths) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            paths,
            game_state: GameState::default(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.paths.install_path.as_os_str().is_empty()
            || self.paths.download_path.as_os_str().is_empty()
        {
            return Err("paths must not be empty".into());
        }
        let state = &self.game_state;
        let versions = [
            &state.installed_version,
            &state.available_version,
            &state.patches.downloaded_version,
            &state.patches.applied_version,
        ];
        if versions.iter().any(|v| v.trim().is_empty()) {
            return Err("game state contains an empty version".into());
        }
        Ok(())
    }
}

// Schema 1 kept the paths at the top level and flattened the game flags.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyDocumentV1 {
    install_path: PathBuf,
    download_path: PathBuf,
    #[serde(default)]
    custom_install_dir: Option<PathBuf>,
    game_state: LegacyGameStateV1,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyGameStateV1 {
    installed_version: String,
    #[serde(default)]
    available_version: Option<String>,
    #[serde(default)]
    is_base_game_downloaded: bool,
    #[serde(default)]
    is_base_game_extracted: bool,
    #[serde(default)]
    downloaded_patch_version: Option<String>,
    #[serde(default)]
    applied_patch_version: Option<String>,
    #[serde(default)]
    download_progress: Option<DownloadProgress>,
}

impl From<LegacyDocumentV1> for StorageDocument {
    fn from(old: LegacyDocumentV1) -> Self {
        let legacy = old.game_state;
        let installed = legacy.installed_version;
        Self {
            schema_version: SCHEMA_VERSION,
            paths: StoragePaths {
                install_path: old.install_path,
                download_path: old.download_path,
                custom_install_dir: old.custom_install_dir,
            },
            game_state: GameState {
                available_version: legacy
                    .available_version
                    .unwrap_or_else(|| installed.clone()),
                base_game: BaseGameState {
                    is_downloaded: legacy.is_base_game_downloaded,
                    is_extracted: legacy.is_base_game_extracted,
                },
                patches: PatchState {
                    downloaded_version: legacy
                        .downloaded_patch_version
                        .unwrap_or_else(|| installed.clone()),
                    applied_version: legacy
                        .applied_patch_version
                        .unwrap_or_else(|| installed.clone()),
                },
                download_progress: legacy.download_progress,
                installed_version: installed,
            },
        }
    }
}

/// Result of interpreting the raw state file.
#[derive(Debug)]
pub enum Decoded {
    Current(StorageDocument),
    Migrated { document: StorageDocument, from: u32 },
    Invalid(String),
}

/// Interpret raw state-file contents without touching the filesystem.
pub fn decode(raw: &str) -> Decoded {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => return Decoded::Invalid(format!("malformed JSON: {err}")),
    };
    if !value.is_object() {
        return Decoded::Invalid("state root is not an object".into());
    }

    // Schema 1 files written before versioning carried no schemaVersion at all.
    let version = match value.get("schemaVersion") {
        None => 1,
        Some(v) => match v.as_u64() {
            Some(v) => v,
            None => return Decoded::Invalid("schemaVersion is not an integer".into()),
        },
    };

    match version {
        v if v == u64::from(SCHEMA_VERSION) => {
            match serde_json::from_value::<StorageDocument>(value) {
                Ok(document) => match document.validate() {
                    Ok(()) => Decoded::Current(document),
                    Err(reason) => Decoded::Invalid(reason),
                },
                Err(err) => Decoded::Invalid(format!("missing or invalid fields: {err}")),
            }
        }
        1 => match serde_json::from_value::<LegacyDocumentV1>(value) {
            Ok(old) => {
                let document = StorageDocument::from(old);
                match document.validate() {
                    Ok(()) => Decoded::Migrated { document, from: 1 },
                    Err(reason) => Decoded::Invalid(reason),
                }
            }
            Err(err) => Decoded::Invalid(format!("unrecognised schema 1 document: {err}")),
        },
        other => Decoded::Invalid(format!("unknown schemaVersion {other}")),
    }
}
