use crate::engine::models::Patch;

/// Per-step state of the update pipeline.
///
/// `Idle -> Downloading -> Verifying -> Extracting -> VerifyingExtraction -> Advanced`,
/// with `Failed` reachable from every working stage and `Stalled` from `Idle`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateStage {
    Idle,
    Downloading,
    Verifying,
    Extracting,
    VerifyingExtraction,
    Advanced { version: String },
    Stalled { version: String },
    Failed { reason: String },
}

impl UpdateStage {
    pub fn label(&self) -> &'static str {
        match self {
            UpdateStage::Idle => "idle",
            UpdateStage::Downloading => "download",
            UpdateStage::Verifying => "verify",
            UpdateStage::Extracting => "extract",
            UpdateStage::VerifyingExtraction => "verify-extraction",
            UpdateStage::Advanced { .. } => "advanced",
            UpdateStage::Stalled { .. } => "stalled",
            UpdateStage::Failed { .. } => "failed",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: &UpdateStage) -> bool {
        use UpdateStage::*;
        match (self, next) {
            (Idle, Downloading | Stalled { .. }) => true,
            (Downloading, Verifying | Idle | Failed { .. }) => true,
            (Verifying, Extracting | Failed { .. }) => true,
            (Extracting, VerifyingExtraction | Failed { .. }) => true,
            (VerifyingExtraction, Advanced { .. } | Failed { .. }) => true,
            (Advanced { .. }, Idle) => true,
            (Failed { .. } | Stalled { .. }, Idle) => true,
            _ => false,
        }
    }
}

/// Notifications emitted while the engine works.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// A step identified by `target` ("base-game" or a patch id) changed stage.
    Stage { target: String, stage: UpdateStage },
    /// `(stageOrPatchId, current, total)` progress tuple.
    Progress {
        target: String,
        stage: &'static str,
        current: u64,
        total: u64,
    },
}

pub const BASE_GAME_TARGET: &str = "base-game";
/// Target used for events about the chain as a whole rather than one patch.
pub const PATCH_CHAIN_TARGET: &str = "patch-chain";

/// How a patch-chain run ended when it did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainOutcome {
    UpToDate { version: String },
    Completed { version: String, applied: usize },
    /// No patch starts at the installed version; state is consistent but behind.
    Stalled {
        installed: String,
        latest: String,
        applied: usize,
    },
    Paused { patch: String, applied: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { version: String },
    AlreadyInstalled { version: String },
    Paused,
}

/// What a full update run did. `chain` is `None` when the base install paused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateReport {
    pub base_game: Option<InstallOutcome>,
    pub chain: Option<ChainOutcome>,
}

/// Summary of where the client stands relative to the published manifests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateStatus {
    NotInstalled { base_version: String },
    UpToDate { version: String },
    PatchesAvailable { installed: String, chain: Vec<Patch> },
    Stalled { installed: String, latest: String },
}
