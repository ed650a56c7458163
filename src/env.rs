use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "patchline";
const STATE_FILE: &str = "state.json";

/// Supplies the directories the engine installs into and downloads to.
pub trait PathResolver: Send + Sync {
    fn install_dir(&self) -> PathBuf;
    fn downloads_dir(&self) -> PathBuf;
}

/// Returns the per-user root directory used by the updater.
pub fn default_app_dir() -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("XDG_DATA_HOME").map(PathBuf::from).or_else(|| {
            env::var_os("HOME")
                .map(PathBuf::from)
                .map(|home| home.join(".local").join("share"))
        }),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR_NAME)
}

/// Directory layout rooted at a data directory.
#[derive(Clone, Debug)]
pub struct AppPaths {
    root: PathBuf,
    custom_install_dir: Option<PathBuf>,
}

impl AppPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            custom_install_dir: None,
        }
    }

    /// A user-chosen install directory wins over the default layout.
    #[must_use]
    pub fn with_custom_install_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.custom_install_dir = dir.filter(|d| !d.as_os_str().is_empty());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn default_install_dir(&self) -> PathBuf {
        self.root.join("game")
    }

    /// Create the on-disk folder layout expected by the engine.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [self.root.clone(), self.install_dir(), self.downloads_dir()] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new(default_app_dir())
    }
}

impl PathResolver for AppPaths {
    fn install_dir(&self) -> PathBuf {
        self.custom_install_dir
            .clone()
            .unwrap_or_else(|| self.default_install_dir())
    }

    fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }
}
