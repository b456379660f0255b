//! Global constants and helpers: builtin sentinel, storage keys, on-disk layout, networking defaults
use std::path::{Path, PathBuf};

/// Library name used in user agents and stats payloads
pub const LIB_NAME: &str = "otabundle";

/// Package version from Cargo.toml (set at compile time)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the user agent string for HTTP requests
pub fn user_agent() -> String {
    format!("{}/{}", LIB_NAME, VERSION)
}

// ============================================================================
// Builtin Bundle Sentinel
// ============================================================================

/// Reserved id of the bundle shipped inside the native app install.
/// Never stored, never deleted, universal terminal fallback.
pub const BUILTIN_ID: &str = "builtin";

/// Version name reported for the builtin bundle
pub const BUILTIN_VERSION: &str = "builtin";

// ============================================================================
// Persisted Keys
// ============================================================================

/// Device id, generated once on first run
pub const KEY_DEVICE_ID: &str = "device_id";

/// Native app version seen on the previous run
pub const KEY_LAST_NATIVE_VERSION: &str = "last_native_version";

/// Id of the bundle currently serving content
pub const KEY_CURRENT_BUNDLE: &str = "current_bundle";

/// Id of the bundle staged for the next activation point
pub const KEY_NEXT_BUNDLE: &str = "next_bundle";

/// One-shot flag suppressing the next background activation cycle
pub const KEY_DELAY_UPDATE: &str = "delay_update";

/// Key prefix for per-bundle catalog entries
pub const BUNDLE_KEY_PREFIX: &str = "bundle.";

/// Returns the storage key holding the catalog entry for a bundle id
pub fn bundle_key(id: &str) -> String {
    format!("{}{}", BUNDLE_KEY_PREFIX, id)
}

// ============================================================================
// On-Disk Layout
// ============================================================================

/// File name of the durable key-value store inside the content root
pub const STORE_FILENAME: &str = "otabundle_store.json";

/// Directory holding extracted bundle content, one subdirectory per id
pub const BUNDLES_DIR: &str = "bundles";

/// Directory holding in-flight download artifacts
pub const DOWNLOADS_DIR: &str = "downloads";

/// Resolves the content directory for a bundle id
pub fn bundle_dir(root: impl AsRef<Path>, id: &str) -> PathBuf {
    root.as_ref().join(BUNDLES_DIR).join(id)
}

/// Resolves the partial-download path for a bundle id
pub fn download_part_path(root: impl AsRef<Path>, id: &str) -> PathBuf {
    root.as_ref().join(DOWNLOADS_DIR).join(format!("{}.part", id))
}

// ============================================================================
// Timeout / Networking Defaults
// ============================================================================

/// Milliseconds the running app has to call `notify_app_ready` before rollback
pub const DEFAULT_APP_READY_TIMEOUT_MS: u64 = 10_000;

/// HTTP request timeout for manifest checks (seconds)
pub const HTTP_MANIFEST_TIMEOUT_SECS: u64 = 20;

/// HTTP request timeout for artifact downloads (seconds)
pub const HTTP_DOWNLOAD_TIMEOUT_SECS: u64 = 120;

/// HTTP request timeout for stats reporting (seconds)
pub const HTTP_STATS_TIMEOUT_SECS: u64 = 10;
