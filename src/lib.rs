//! Update and patch engine for desktop game clients: resumable downloads,
//! checksum verification, a self-healing state file and patch-chain application.

pub mod checksum;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod env;
pub mod error;
pub mod extract;
pub mod networking;
pub mod storage;
pub mod updater;
pub mod util;

#[cfg(test)]
mod testing;

pub use config::{EngineConfig, RetryPolicy};
pub use engine::PatchEngine;
pub use engine::models::{BaseGameRelease, Patch, PatchManifest, ReleaseManifest};
pub use engine::state::{
    ChainOutcome, EngineEvent, InstallOutcome, UpdateReport, UpdateStage, UpdateStatus,
};
pub use env::{AppPaths, PathResolver};
pub use error::{Result, UpdateError};
pub use extract::{ArchiveExtractor, Extractor};
pub use storage::StateStore;
