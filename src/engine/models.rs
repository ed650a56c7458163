use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};

/// Release document published alongside every client build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseManifest {
    pub minimum_launcher_version: String,
    pub game: BaseGameRelease,
    pub patch_manifest_url: String,
    pub patch_notes_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseGameRelease {
    pub base_version: String,
    pub full_url: String,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchManifest {
    pub latest_version: String,
    #[serde(default)]
    pub patches: Vec<Patch>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub from: String,
    pub to: String,
    pub full_url: String,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl Patch {
    pub fn id(&self) -> String {
        format!("{}->{}", self.from, self.to)
    }
}

/// Outcome of looking for a version to adopt when the installed version is unknown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryCandidate {
    Found(String),
    Ambiguous(Vec<String>),
    None,
}

impl PatchManifest {
    /// Reject manifests the orchestrator cannot walk safely.
    pub fn validate(&self) -> Result<()> {
        if self.latest_version.trim().is_empty() {
            return Err(UpdateError::InvalidManifest(
                "latestVersion is empty".into(),
            ));
        }
        let mut seen = HashSet::new();
        for patch in &self.patches {
            if patch.from.trim().is_empty() || patch.to.trim().is_empty() {
                return Err(UpdateError::InvalidManifest(format!(
                    "patch {} has an empty version",
                    patch.id()
                )));
            }
            if patch.from == patch.to {
                return Err(UpdateError::InvalidManifest(format!(
                    "patch {} does not change the version",
                    patch.id()
                )));
            }
            if patch.full_url.trim().is_empty() || patch.sha256.trim().is_empty() {
                return Err(UpdateError::InvalidManifest(format!(
                    "patch {} is missing its url or sha256",
                    patch.id()
                )));
            }
            if !seen.insert((patch.from.as_str(), patch.to.as_str())) {
                return Err(UpdateError::InvalidManifest(format!(
                    "duplicate patch {}",
                    patch.id()
                )));
            }
        }
        Ok(())
    }

    /// Whether following patches from `version` can arrive at `latest_version`.
    pub fn reaches_latest(&self, version: &str) -> bool {
        let mut visited = HashSet::new();
        let mut pending = vec![version];
        while let Some(current) = pending.pop() {
            if current == self.latest_version {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            pending.extend(
                self.patches
                    .iter()
                    .filter(|p| p.from == current)
                    .map(|p| p.to.as_str()),
            );
        }
        false
    }

    /// The patch to apply next from `version`.
    ///
    /// When several patches start at `version`, one landing directly on the
    /// latest version wins, then one whose chain still reaches it.
    pub fn next_patch(&self, version: &str) -> Option<&Patch> {
        let candidates: Vec<&Patch> = self.patches.iter().filter(|p| p.from == version).collect();
        candidates
            .iter()
            .find(|p| p.to == self.latest_version)
            .or_else(|| candidates.iter().find(|p| self.reaches_latest(&p.to)))
            .or_else(|| candidates.first())
            .copied()
    }

    /// The ordered patches the orchestrator would apply starting at `version`.
    pub fn chain_from(&self, version: &str) -> Vec<&Patch> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = version;
        while current != self.latest_version && visited.insert(current) {
            match self.next_patch(current) {
                Some(patch) => {
                    chain.push(patch);
                    current = &patch.to;
                }
                None => break,
            }
        }
        chain
    }

    /// Pick the version a client with unknown version but present files most
    /// plausibly sits at: the single chain root that leads to the latest version.
    pub fn recovery_candidate(&self) -> RecoveryCandidate {
        let targets: HashSet<&str> = self.patches.iter().map(|p| p.to.as_str()).collect();
        let mut roots = self.reaching_sources(|from| !targets.contains(from));
        if roots.is_empty() {
            roots = self.reaching_sources(|_| true);
        }
        match roots.len() {
            0 => RecoveryCandidate::None,
            1 => RecoveryCandidate::Found(roots.remove(0)),
            _ => RecoveryCandidate::Ambiguous(roots),
        }
    }

    fn reaching_sources(&self, keep: impl Fn(&str) -> bool) -> Vec<String> {
        let mut sources: Vec<String> = Vec::new();
        for patch in &self.patches {
            if patch.from == self.latest_version || !keep(patch.from.as_str()) {
                continue;
            }
            if sources.contains(&patch.from) || !self.reaches_latest(&patch.from) {
                continue;
            }
            sources.push(patch.from.clone());
        }
        sources
    }
}

#[cfg(test)]
pub(crate) fn patch(from: &str, to: &str) -> Patch {
    Patch {
        from: from.into(),
        to: to.into(),
        full_url: format!("https://cdn.example.com/patch-{from}-{to}.zip"),
        sha256: "0".repeat(64),
        size_bytes: None,
    }
}
