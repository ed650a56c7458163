use std::fmt::Write;
use std::io;

use log::debug;
use serde::Serialize;

use crate::error::UpdateError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorCategory {
    Network,
    Filesystem,
    Verification,
    Configuration,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Severity {
    Retryable,
    Fatal,
}

/// User-facing description of a failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub title: String,
    pub user_message: String,
    pub suggestions: Vec<String>,
    /// The raw error text, for logs and support requests.
    pub detail: String,
}

impl ErrorReport {
    pub fn is_retryable(&self) -> bool {
        self.severity == Severity::Retryable
    }
}

struct Profile {
    category: ErrorCategory,
    severity: Severity,
    title: &'static str,
    message: &'static str,
    suggestions: &'static [&'static str],
}

impl Profile {
    fn report(&self, detail: String) -> ErrorReport {
        ErrorReport {
            category: self.category,
            severity: self.severity,
            title: self.title.to_owned(),
            user_message: self.message.to_owned(),
            suggestions: self.suggestions.iter().map(|s| (*s).to_owned()).collect(),
            detail,
        }
    }
}

const NETWORK: Profile = Profile {
    category: ErrorCategory::Network,
    severity: Severity::Retryable,
    title: "Connection problem",
    message: "The update server could not be reached or stopped responding.",
    suggestions: &[
        "Check your internet connection",
        "Try again in a few minutes",
        "Check whether a firewall or proxy blocks the launcher",
    ],
};

const VERIFICATION: Profile = Profile {
    category: ErrorCategory::Verification,
    severity: Severity::Retryable,
    title: "Download verification failed",
    message: "A downloaded file did not match what the server published and was discarded.",
    suggestions: &[
        "Retry the update to download the file again",
        "If it keeps failing, your connection may be altering downloads",
    ],
};

const PERMISSION: Profile = Profile {
    category: ErrorCategory::Filesystem,
    severity: Severity::Fatal,
    title: "Permission denied",
    message: "The launcher is not allowed to write to the game or download folder.",
    suggestions: &[
        "Choose an install folder your user account can write to",
        "Close other programs that may be using the game files",
    ],
};

const DISK_SPACE: Profile = Profile {
    category: ErrorCategory::Filesystem,
    severity: Severity::Fatal,
    title: "Not enough disk space",
    message: "The drive holding the game ran out of space.",
    suggestions: &[
        "Free up disk space and try again",
        "Move the install folder to a drive with more space",
    ],
};

const MISSING_FILE: Profile = Profile {
    category: ErrorCategory::Filesystem,
    severity: Severity::Retryable,
    title: "File missing",
    message: "A file the update needed was not found.",
    suggestions: &["Retry the update", "Make sure no other program deletes files in the game folder"],
};

const CONFIGURATION: Profile = Profile {
    category: ErrorCategory::Configuration,
    severity: Severity::Fatal,
    title: "Installation needs attention",
    message: "The installed version could not be matched to the published updates.",
    suggestions: &[
        "Reinstall the game",
        "Update the launcher to the latest version",
    ],
};

const EXTRACTION: Profile = Profile {
    category: ErrorCategory::Filesystem,
    severity: Severity::Retryable,
    title: "Could not unpack update",
    message: "The update archive could not be extracted into the game folder.",
    suggestions: &[
        "Retry the update",
        "Check that the game folder is writable and not in use",
    ],
};

const STORAGE: Profile = Profile {
    category: ErrorCategory::Filesystem,
    severity: Severity::Fatal,
    title: "Launcher data could not be saved",
    message: "The launcher could not write its state file.",
    suggestions: &["Check that the launcher data folder is writable"],
};

const UNKNOWN: Profile = Profile {
    category: ErrorCategory::Unknown,
    severity: Severity::Fatal,
    title: "Unexpected error",
    message: "Something went wrong while updating.",
    suggestions: &["Restart the launcher", "Contact support with the details below"],
};

/// Substring rules for raw error text, checked in order.
const MESSAGE_RULES: &[(&[&str], &Profile)] = &[
    (
        &[
            "connection",
            "timed out",
            "timeout",
            "dns",
            "network",
            "http status",
            "redirect",
            "unreachable",
            "econnreset",
            "enotfound",
            "socket",
        ],
        &NETWORK,
    ),
    (
        &["size mismatch", "checksum", "hash", "verification", "verify"],
        &VERIFICATION,
    ),
    (
        &[
            "permission denied",
            "access is denied",
            "operation not permitted",
            "eacces",
            "eperm",
            "read-only",
        ],
        &PERMISSION,
    ),
    (
        &["no space", "disk full", "enospc", "quota"],
        &DISK_SPACE,
    ),
    (
        &["not found", "no such file", "enoent", "cannot find"],
        &MISSING_FILE,
    ),
    (
        &[
            "configuration",
            "patch chain",
            "reapply",
            "reinstall",
            "invalid manifest",
            "launcher update required",
        ],
        &CONFIGURATION,
    ),
    (
        &["extract", "unzip", "archive", "corrupt"],
        &EXTRACTION,
    ),
];

/// Classify a typed engine error.
pub fn classify(err: &UpdateError) -> ErrorReport {
    let detail = err.to_string();
    let profile = match err {
        UpdateError::NetworkFatal { .. } => &NETWORK,
        UpdateError::SizeMismatch { .. }
        | UpdateError::ChecksumMismatch { .. }
        | UpdateError::ExtractionVerificationFailed { .. } => &VERIFICATION,
        UpdateError::ExtractionFailed { .. } => &EXTRACTION,
        UpdateError::Io { source, .. } => match source.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => &PERMISSION,
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => &DISK_SPACE,
            io::ErrorKind::NotFound => &MISSING_FILE,
            _ => return classify_message(&detail),
        },
        UpdateError::ConfigurationMissing(_)
        | UpdateError::PatchChainBroken(_)
        | UpdateError::InvalidManifest(_)
        | UpdateError::LauncherOutdated { .. } => &CONFIGURATION,
        UpdateError::Storage(_) => &STORAGE,
    };
    profile.report(detail)
}

/// Classify an error known only by its rendered text.
pub fn classify_message(message: &str) -> ErrorReport {
    let lowered = message.to_lowercase();
    let profile = MESSAGE_RULES
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lowered.contains(n)))
        .map_or(&UNKNOWN, |(_, profile)| *profile);
    debug!("diagnostics: classified {:?} as {}", message, profile.title);
    profile.report(message.to_owned())
}

/// Whether the caller should offer an automatic retry.
pub fn is_retryable(err: &UpdateError) -> bool {
    classify(err).is_retryable()
}

pub fn format_report(report: &ErrorReport) -> String {
    let mut output = String::new();
    let severity = match report.severity {
        Severity::Retryable => "can be retried",
        Severity::Fatal => "needs your attention",
    };

    let _ = writeln!(&mut output, "{} ({severity})", report.title);
    let _ = writeln!(&mut output, "{}", report.user_message);
    if !report.suggestions.is_empty() {
        let _ = writeln!(&mut output, "\nWhat you can do:");
        for suggestion in &report.suggestions {
            let _ = writeln!(&mut output, "  - {suggestion}");
        }
    }
    let _ = writeln!(&mut output, "\nDetails: {}", report.detail);
    output
}
