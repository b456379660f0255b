//! Bundle catalog entries and the status state machine governing them
use crate::constants;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

// ============================================================================
// Status State Machine
// ============================================================================

/// Lifecycle status of a managed bundle.
///
/// Legal flow is `Downloading → Downloaded → PendingActivation → Active →
/// Success`, with `Error` reachable from Downloading, Downloaded and Active,
/// and `Deleted` reachable from any non-Active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    /// Artifact fetch/extraction in progress; must not be activated
    Downloading,
    /// Artifact verified and materialized; eligible to become `next`
    Downloaded,
    /// Staged as the next bundle, activated at the next background boundary
    PendingActivation,
    /// Currently serving content, not yet confirmed by the running app
    Active,
    /// Running app confirmed correct boot before the readiness deadline
    Success,
    /// Download failed, checksum mismatched, or readiness deadline expired
    Error,
    /// Tombstone: files purged, entry awaiting re-download or final removal
    Deleted,
}

impl BundleStatus {
    /// Whether a transition from `self` to `to` is legal
    pub fn can_transition(self, to: BundleStatus) -> bool {
        use BundleStatus::*;
        match (self, to) {
            (Downloading, Downloaded) => true,
            (Downloaded, PendingActivation) => true,
            (Downloaded, Active) => true, // direct update skips staging
            (PendingActivation, Active) => true,
            (Active, Success) => true,
            (Success, Active) => true, // fallback reactivation
            (Downloading | Downloaded | Active, Error) => true,
            // Deleted from any non-active state; re-download purges the tombstone
            (Downloading | Downloaded | PendingActivation | Success | Error, Deleted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BundleStatus::Downloading => "downloading",
            BundleStatus::Downloaded => "downloaded",
            BundleStatus::PendingActivation => "pending_activation",
            BundleStatus::Active => "active",
            BundleStatus::Success => "success",
            BundleStatus::Error => "error",
            BundleStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Bundle Info
// ============================================================================

/// One managed bundle version as persisted in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleInfo {
    pub id: String,
    pub version_name: String,
    #[serde(default)]
    pub download_url: String,
    /// Integrity hash of the downloaded artifact, if the manifest carried one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Opaque decryption/session token passed through to the artifact fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub status: BundleStatus,
    /// Filesystem location of extracted content, empty if not materialized
    #[serde(default)]
    pub path: String,
    /// RFC3339 timestamp set when the download completed
    #[serde(default)]
    pub downloaded: String,
}

impl BundleInfo {
    /// Stable id derived from a version name
    pub fn id_for_version(version_name: &str) -> String {
        let digest = Sha256::digest(version_name.as_bytes());
        // 8 bytes of the digest is plenty for a per-device namespace
        hex_prefix(&digest, 8)
    }

    pub fn new(version_name: impl Into<String>, download_url: impl Into<String>) -> Self {
        let version_name = version_name.into();
        BundleInfo {
            id: Self::id_for_version(&version_name),
            version_name,
            download_url: download_url.into(),
            checksum: None,
            session_key: None,
            status: BundleStatus::Downloading,
            path: String::new(),
            downloaded: String::new(),
        }
    }

    /// The synthetic entry for the content shipped with the native install.
    /// Never persisted, never deleted, terminal fallback for every rollback.
    pub fn builtin() -> Self {
        BundleInfo {
            id: constants::BUILTIN_ID.to_string(),
            version_name: constants::BUILTIN_VERSION.to_string(),
            download_url: String::new(),
            checksum: None,
            session_key: None,
            status: BundleStatus::Success,
            path: String::new(),
            downloaded: String::new(),
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.id == constants::BUILTIN_ID
    }

    pub fn is_downloaded(&self) -> bool {
        matches!(
            self.status,
            BundleStatus::Downloaded
                | BundleStatus::PendingActivation
                | BundleStatus::Active
                | BundleStatus::Success
        )
    }

    pub fn is_error(&self) -> bool {
        self.status == BundleStatus::Error
    }

    pub fn is_deleted(&self) -> bool {
        self.status == BundleStatus::Deleted
    }
}

impl fmt::Display for BundleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.version_name, self.id, self.status)
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes.iter().take(len).map(|b| format!("{:02x}", b)).collect()
}
