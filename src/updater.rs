//! Update orchestration: manifest polling decisions, download/staging,
//! activation, readiness confirmation, rollback and fallback selection
use crate::bundle::{BundleInfo, BundleStatus};
use crate::catalog::Catalog;
use crate::config::{major_of, UpdaterConfig};
use crate::constants;
use crate::device::DeviceState;
use crate::error::{UpdateError, UpdateResult};
use crate::guard::ActivationGuard;
use crate::host::HostEvents;
use crate::remote::{DeviceInfo, RemoteClient};
use crate::store::{FileStore, KeyValueStore};
use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// How a freshly available bundle reaches the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingPolicy {
    /// Activate immediately and ask the host to reload its content view
    Direct,
    /// Mark as `next`; activation happens at the background boundary
    Deferred,
}

/// The bundle version lifecycle manager.
///
/// Cheap to clone; all state lives behind one shared inner. Must be used
/// inside a tokio runtime (downloads, the readiness guard and stats
/// reporting are tasks).
#[derive(Clone)]
pub struct Updater {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    config: UpdaterConfig,
    root: PathBuf,
    device: Arc<DeviceState>,
    catalog: Catalog,
    remote: RemoteClient,
    host: Arc<dyn HostEvents>,
    guard: ActivationGuard,
    weak_self: std::sync::Mutex<Weak<Inner>>,
}

impl Updater {
    /// Opens the updater over a file-backed store under `root`
    pub fn open(root: PathBuf, config: UpdaterConfig, host: Arc<dyn HostEvents>) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> =
            Arc::new(FileStore::open(root.join(constants::STORE_FILENAME))?);
        Self::with_store(root, config, store, host)
    }

    /// Opens the updater over a caller-supplied store
    pub fn with_store(
        root: PathBuf,
        config: UpdaterConfig,
        store: Arc<dyn KeyValueStore>,
        host: Arc<dyn HostEvents>,
    ) -> Result<Self> {
        let device = Arc::new(DeviceState::open(store.clone())?);
        let catalog = Catalog::new(store, device.clone(), root.clone());
        let inner = Arc::new(Inner {
            config,
            root,
            device,
            catalog,
            remote: RemoteClient::new()?,
            host,
            guard: ActivationGuard::new(),
            weak_self: std::sync::Mutex::new(Weak::new()),
        });
        *inner.weak_self.lock().unwrap() = Arc::downgrade(&inner);
        let updater = Updater { inner };
        updater.cleanup_obsolete_versions()?;
        Ok(updater)
    }

    // ==================================================================
    // Identity / accessors
    // ==================================================================

    pub fn device_id(&self) -> String {
        self.inner.device.device_id()
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.inner.config
    }

    /// All non-deleted catalog entries
    pub fn list(&self) -> Vec<BundleInfo> {
        self.inner.catalog.list()
    }

    pub fn get(&self, id: &str) -> UpdateResult<BundleInfo> {
        self.inner.catalog.get(id)
    }

    /// The bundle currently serving content. A dangling pointer (entry
    /// deleted out of band) falls back to builtin.
    pub fn current(&self) -> BundleInfo {
        let id = self.inner.device.current_bundle_id();
        match self.inner.catalog.get(&id) {
            Ok(bundle) => bundle,
            Err(_) => {
                if id != constants::BUILTIN_ID {
                    log::warn!("Current bundle {} vanished, using builtin", id);
                    let _ = self.inner.device.set_current_bundle_id(constants::BUILTIN_ID);
                }
                BundleInfo::builtin()
            }
        }
    }

    /// The bundle staged for the next activation point, if any
    pub fn next(&self) -> Option<BundleInfo> {
        let id = self.inner.device.next_bundle_id()?;
        self.inner.catalog.get(&id).ok()
    }

    pub fn is_using_builtin(&self) -> bool {
        self.current().is_builtin()
    }

    /// Content root for the host's view: `None` means the builtin assets
    pub fn current_bundle_path(&self) -> Option<PathBuf> {
        let current = self.current();
        if current.is_builtin() || current.path.is_empty() {
            None
        } else {
            Some(PathBuf::from(current.path))
        }
    }

    /// Most recent confirmed bundle other than the current one; builtin if
    /// no downloaded bundle ever reached `Success`
    pub fn fallback(&self) -> BundleInfo {
        let current_id = self.inner.device.current_bundle_id();
        self.inner
            .catalog
            .list()
            .into_iter()
            .filter(|b| b.status == BundleStatus::Success && b.id != current_id)
            .max_by(|a, b| a.downloaded.cmp(&b.downloaded))
            .unwrap_or_else(BundleInfo::builtin)
    }

    // ==================================================================
    // Operations surface
    // ==================================================================

    /// Activates a bundle: sets it current, reloads the host's content view
    /// and arms the readiness guard. Setting the already-current id is a
    /// no-op success.
    pub fn set(&self, id: &str) -> UpdateResult<()> {
        if id == constants::BUILTIN_ID {
            return self.activate_builtin();
        }
        let current_id = self.inner.device.current_bundle_id();
        if current_id == id {
            log::info!("Bundle {} is already current", id);
            return Ok(());
        }

        let bundle = self.inner.catalog.get(id)?;
        match bundle.status {
            BundleStatus::Downloading => {
                return Err(UpdateError::InvalidState(format!(
                    "bundle {} is still downloading",
                    id
                )))
            }
            BundleStatus::Error => {
                return Err(UpdateError::InvalidState(format!(
                    "bundle {} is in error state",
                    id
                )))
            }
            _ => {}
        }

        // A displaced bundle that never confirmed readiness failed
        if current_id != constants::BUILTIN_ID {
            if let Ok(true) =
                self.inner
                    .catalog
                    .claim_transition(&current_id, BundleStatus::Active, BundleStatus::Error)
            {
                log::warn!("Displaced unconfirmed bundle {} marked failed", current_id);
            }
        }

        // Confirmed bundles stay Success when reactivated as a fallback
        let activated = if bundle.status == BundleStatus::Success {
            bundle
        } else {
            self.inner.catalog.set_status(id, BundleStatus::Active)?
        };

        self.inner
            .device
            .set_current_bundle_id(id)
            .map_err(UpdateError::storage)?;
        log::info!("Set active bundle: {}", activated);

        if let Err(e) = self.inner.host.reload(Some(std::path::Path::new(&activated.path))) {
            log::error!("Host reload failed: {}", e);
        }
        self.send_stats("set");

        if activated.status == BundleStatus::Success {
            self.inner.guard.disarm();
        } else {
            self.arm_guard(&activated.id);
        }
        Ok(())
    }

    /// Stages a bundle as `next`, or clears the staging pointer
    pub fn set_next(&self, id: Option<&str>) -> UpdateResult<Option<BundleInfo>> {
        let Some(id) = id else {
            self.inner
                .device
                .set_next_bundle_id(None)
                .map_err(UpdateError::storage)?;
            return Ok(None);
        };
        let bundle = self.inner.catalog.get(id)?;
        match bundle.status {
            BundleStatus::Downloading => {
                return Err(UpdateError::InvalidState(format!(
                    "bundle {} is still downloading",
                    id
                )))
            }
            BundleStatus::Error => {
                return Err(UpdateError::InvalidState(format!(
                    "bundle {} is in error state",
                    id
                )))
            }
            _ => {}
        }
        let staged = if bundle.status == BundleStatus::Downloaded {
            self.inner
                .catalog
                .set_status(id, BundleStatus::PendingActivation)?
        } else {
            bundle
        };
        self.inner
            .device
            .set_next_bundle_id(Some(id))
            .map_err(UpdateError::storage)?;
        log::info!("Staged next bundle: {}", staged);
        Ok(Some(staged))
    }

    /// Deletes a bundle and its content. The current bundle is protected
    /// unless `force`.
    pub fn delete(&self, id: &str, force: bool) -> UpdateResult<()> {
        self.inner.catalog.delete(id, force)?;
        // staging pointer must not dangle
        if self.inner.device.next_bundle_id().as_deref() == Some(id) {
            self.inner
                .device
                .set_next_bundle_id(None)
                .map_err(UpdateError::storage)?;
        }
        self.send_stats("delete");
        Ok(())
    }

    /// Resets to the builtin bundle, or to the last confirmed bundle when
    /// `to_last_successful` and one exists
    pub fn reset(&self, to_last_successful: bool) -> UpdateResult<()> {
        let fallback = self.fallback();
        self.inner.catalog.reset(false)?;
        self.inner.guard.disarm();

        if to_last_successful && !fallback.is_builtin() {
            log::info!("Resetting to: {}", fallback);
            return self.set(&fallback.id);
        }

        log::info!("Resetting to builtin");
        if let Err(e) = self.inner.host.reload(None) {
            log::error!("Host reload failed: {}", e);
        }
        Ok(())
    }

    /// Readiness confirmation from the running app. Wins or loses the race
    /// against the guard deadline atomically; on a win the current bundle
    /// becomes `Success` and the guard is disarmed.
    pub fn notify_app_ready(&self) -> UpdateResult<BundleInfo> {
        let current = self.current();
        if current.is_builtin() {
            self.inner.guard.disarm();
            return Ok(current);
        }
        let won = self.inner.catalog.claim_transition(
            &current.id,
            BundleStatus::Active,
            BundleStatus::Success,
        )?;
        if won {
            self.inner.guard.disarm();
            log::info!("Bundle confirmed ready: {}", current.id);
            self.inner.catalog.get(&current.id)
        } else if current.status == BundleStatus::Success {
            // repeated confirmation is fine
            self.inner.guard.disarm();
            Ok(current)
        } else {
            Err(UpdateError::InvalidState(format!(
                "bundle {} is {} and can no longer be confirmed",
                current.id, current.status
            )))
        }
    }

    /// One-shot suppression of the next background activation cycle
    pub fn delay_update(&self) -> UpdateResult<()> {
        self.inner
            .device
            .set_delay_update(true)
            .map_err(UpdateError::storage)
    }

    pub fn cancel_delay(&self) -> UpdateResult<()> {
        self.inner
            .device
            .set_delay_update(false)
            .map_err(UpdateError::storage)
    }

    // ==================================================================
    // Download / update check
    // ==================================================================

    /// Fetches an artifact into a new catalog entry. The entry passes
    /// `Downloading → Downloaded` on success; network or integrity failures
    /// leave it in `Error` and report a `download_fail` stat.
    pub async fn download(
        &self,
        url: &str,
        version_name: &str,
        session_key: Option<&str>,
        checksum: Option<&str>,
    ) -> UpdateResult<BundleInfo> {
        // A stale tombstone or failed attempt for the same version is purged
        // so the id can be reused
        if let Some(existing) = self.inner.catalog.get_by_version_name(version_name) {
            if existing.is_deleted() || existing.is_error() {
                self.inner.catalog.purge(&existing.id)?;
            } else {
                return Err(UpdateError::InvalidState(format!(
                    "version {} already present ({})",
                    version_name, existing.status
                )));
            }
        }

        let mut bundle = BundleInfo::new(version_name, url);
        bundle.checksum = checksum.map(str::to_string);
        bundle.session_key = session_key.map(str::to_string);
        self.inner.catalog.mark_in_flight(&bundle.id);
        self.inner.catalog.put(&bundle)?;
        log::info!("Downloading bundle {} from {}", bundle.version_name, url);

        // The final entry must land in the store before the in-flight marker
        // is dropped: a concurrent `list` may sweep an unmarked `Downloading`
        // entry and take the materialized content with it
        match self.fetch_and_materialize(&bundle).await {
            Ok(finished) => {
                let persisted = self.inner.catalog.put(&finished);
                self.inner.catalog.clear_in_flight(&bundle.id);
                persisted?;
                log::info!("Downloaded bundle: {}", finished);
                Ok(finished)
            }
            Err(err) => {
                log::error!("Download of {} failed: {}", bundle.version_name, err);
                // keep the failed entry so the orchestrator won't auto-retry
                let mut failed = bundle;
                failed.status = BundleStatus::Error;
                let persisted = self.inner.catalog.put(&failed);
                self.inner.catalog.clear_in_flight(&failed.id);
                persisted?;
                let part = constants::download_part_path(&self.inner.root, &failed.id);
                let _ = std::fs::remove_file(part);
                self.send_stats("download_fail");
                Err(err)
            }
        }
    }

    async fn fetch_and_materialize(&self, bundle: &BundleInfo) -> UpdateResult<BundleInfo> {
        let part = constants::download_part_path(&self.inner.root, &bundle.id);
        let host = self.inner.host.clone();
        let id = bundle.id.clone();
        let digest = self
            .inner
            .remote
            .download_to(
                &bundle.download_url,
                bundle.session_key.as_deref(),
                &part,
                move |percent| host.on_download_progress(&id, percent),
            )
            .await
            .map_err(UpdateError::network)?;

        if let Some(expected) = bundle.checksum.as_deref() {
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(UpdateError::Integrity {
                    id: bundle.id.clone(),
                    expected: expected.to_string(),
                    actual: digest,
                });
            }
        }

        // Materialize into the content directory. Unpacking beyond the move
        // is the packaging pipeline's concern.
        let dir = constants::bundle_dir(&self.inner.root, &bundle.id);
        std::fs::create_dir_all(&dir).map_err(UpdateError::storage)?;
        std::fs::rename(&part, dir.join("bundle.bin")).map_err(UpdateError::storage)?;

        let mut finished = bundle.clone();
        finished.status = BundleStatus::Downloaded;
        finished.path = dir.to_string_lossy().into_owned();
        finished.downloaded = Utc::now().to_rfc3339();
        Ok(finished)
    }

    /// Polls the manifest endpoint and, when it announces a different
    /// version, fetches and stages it per `policy`. Returns the staged
    /// bundle, or `None` when there was nothing to do.
    pub async fn check_for_updates(
        &self,
        policy: StagingPolicy,
    ) -> UpdateResult<Option<BundleInfo>> {
        let url = &self.inner.config.auto_update_url;
        if url.is_empty() {
            return Ok(None);
        }
        log::info!("Checking for update via: {}", url);
        let info = self.device_info();
        let latest = self
            .inner
            .remote
            .get_latest(url, &info)
            .await
            .map_err(UpdateError::network)?;

        if let Some(err) = latest.error {
            log::error!("Manifest error: {}", err);
            return Ok(None);
        }
        if let Some(message) = latest.message {
            log::info!("Manifest message: {}", message);
            if latest.major == Some(true) {
                if let Some(version) = latest.version.as_deref() {
                    self.inner.host.on_major_available(version);
                }
            }
            return Ok(None);
        }

        let current = self.current();
        let Some(version) = latest.version.filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        if version == current.version_name {
            log::info!("No need to update, {} is the latest bundle", current.id);
            return Ok(None);
        }
        let Some(bundle_url) = latest.url.filter(|u| !u.is_empty()) else {
            log::error!("Manifest offered {} without a download URL", version);
            return Ok(None);
        };

        if let Some(existing) = self.inner.catalog.get_by_version_name(&version) {
            if existing.is_error() {
                log::error!("Bundle {} already failed, aborting update", version);
                return Err(UpdateError::InvalidState(format!(
                    "version {} previously failed",
                    version
                )));
            }
            if existing.is_downloaded() {
                // reuse without re-fetch; verified once at download time
                log::info!("Bundle {} already downloaded, staging it", version);
                return self.stage(existing, policy).map(Some);
            }
            if existing.is_deleted() {
                log::info!("Purging stale bundle {} before re-download", version);
                self.inner.catalog.purge(&existing.id)?;
            }
        }

        log::info!(
            "New bundle: {} found. Current is: {}",
            version,
            current.version_name
        );
        let downloaded = self
            .download(
                &bundle_url,
                &version,
                latest.session_key.as_deref(),
                latest.checksum.as_deref(),
            )
            .await?;
        self.stage(downloaded, policy).map(Some)
    }

    fn stage(&self, bundle: BundleInfo, policy: StagingPolicy) -> UpdateResult<BundleInfo> {
        match policy {
            StagingPolicy::Direct => {
                self.set(&bundle.id)?;
                self.set_next(None)?;
                let activated = self.inner.catalog.get(&bundle.id)?;
                Ok(activated)
            }
            StagingPolicy::Deferred => {
                let staged = self
                    .set_next(Some(&bundle.id))?
                    .unwrap_or(bundle);
                log::info!(
                    "Update will be installed next time the app moves to background"
                );
                self.inner.host.on_update_available(&staged);
                Ok(staged)
            }
        }
    }

    /// Staging policy from configuration
    pub fn staging_policy(&self) -> StagingPolicy {
        if self.inner.config.direct_update {
            StagingPolicy::Direct
        } else {
            StagingPolicy::Deferred
        }
    }

    // ==================================================================
    // Rollback
    // ==================================================================

    /// Marks the current bundle failed and reactivates the best fallback.
    /// Called when the readiness deadline expires or background evaluation
    /// finds an unconfirmed current bundle.
    pub(crate) fn rollback_current(&self, current: &BundleInfo) {
        if current.is_builtin() {
            return;
        }
        log::warn!(
            "Update failed: readiness was never confirmed for {}",
            current
        );
        // tolerate Downloaded/PendingActivation leftovers as well
        match self
            .inner
            .catalog
            .claim_transition(&current.id, BundleStatus::Active, BundleStatus::Error)
        {
            Ok(true) => {}
            Ok(false) => log::debug!("Bundle {} already left Active", current.id),
            Err(e) => log::error!("Failed to mark {} failed: {}", current.id, e),
        }
        self.inner.host.on_update_failed(current);
        self.send_stats("revert");

        let fallback = self.fallback();
        log::warn!("Reverting to: {}", fallback);
        if fallback.is_builtin() {
            if let Err(e) = self.reset(false) {
                log::error!("Reset to builtin failed: {}", e);
            }
        } else if let Err(e) = self.set(&fallback.id) {
            // builtin is the guaranteed terminal fallback
            log::error!("Revert to {} failed: {}, resetting to builtin", fallback, e);
            let _ = self.reset(false);
        }

        if self.inner.config.auto_delete_failed {
            log::info!("Deleting failed bundle: {}", current.version_name);
            if let Err(e) = self.delete(&current.id, true) {
                log::error!("Failed to delete failed bundle {}: {}", current.id, e);
            }
        }
    }

    // ==================================================================
    // Guard wiring
    // ==================================================================

    /// Arms the readiness deadline for a non-builtin activation
    pub(crate) fn arm_guard(&self, bundle_id: &str) {
        if bundle_id == constants::BUILTIN_ID {
            return;
        }
        let weak = self.inner.weak_self.lock().unwrap().clone();
        let timeout = Duration::from_millis(self.inner.config.app_ready_timeout);
        self.inner.guard.arm(bundle_id, timeout, move || async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let updater = Updater { inner };
            let current = updater.current();
            if current.is_builtin() || current.status == BundleStatus::Success {
                return;
            }
            log::error!(
                "notify_app_ready was not called within the deadline, rolling back {}",
                current.id
            );
            updater.rollback_current(&current);
        });
    }

    /// Whether the guard is currently armed (test/diagnostic hook)
    pub fn guard_armed_for(&self) -> Option<String> {
        self.inner.guard.armed_for()
    }

    // ==================================================================
    // Internals
    // ==================================================================

    fn activate_builtin(&self) -> UpdateResult<()> {
        let current_id = self.inner.device.current_bundle_id();
        if current_id != constants::BUILTIN_ID {
            if let Ok(true) =
                self.inner
                    .catalog
                    .claim_transition(&current_id, BundleStatus::Active, BundleStatus::Error)
            {
                log::warn!("Displaced unconfirmed bundle {} marked failed", current_id);
            }
        }
        self.inner
            .device
            .set_current_bundle_id(constants::BUILTIN_ID)
            .map_err(UpdateError::storage)?;
        self.inner.guard.disarm();
        if let Err(e) = self.inner.host.reload(None) {
            log::error!("Host reload failed: {}", e);
        }
        Ok(())
    }

    /// Scenario: the native app was upgraded. A major version increase
    /// invalidates every downloaded bundle; the new install's builtin is
    /// the only content known to match the native code.
    fn cleanup_obsolete_versions(&self) -> Result<()> {
        let native = &self.inner.config.version_native;
        if self.inner.config.reset_when_update && !native.is_empty() {
            if let Some(previous) = self.inner.device.last_native_version() {
                if major_of(native) > major_of(&previous) {
                    log::info!("New native major version detected: {}", native);
                    self.inner.catalog.reset(true)?;
                    self.inner.guard.disarm();
                    for bundle in self.inner.catalog.list() {
                        log::info!("Deleting obsolete bundle: {}", bundle.id);
                        if let Err(e) = self.inner.catalog.delete(&bundle.id, true) {
                            log::error!("Failed to delete {}: {}", bundle.id, e);
                        }
                    }
                }
            }
        }
        if !native.is_empty() {
            self.inner.device.set_last_native_version(native)?;
        }
        Ok(())
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            platform: std::env::consts::OS.to_string(),
            device_id: self.inner.device.device_id(),
            app_id: self.inner.config.app_id.clone(),
            version_name: self.current().version_name,
            version_native: self.inner.config.version_native.clone(),
            plugin_version: constants::VERSION.to_string(),
            action: None,
        }
    }

    fn send_stats(&self, action: &str) {
        let info = self.device_info();
        self.inner
            .remote
            .send_stats(&self.inner.config.stats_url, action, &info);
    }

    pub(crate) fn device(&self) -> &DeviceState {
        &self.inner.device
    }

    pub(crate) fn auto_delete_previous(&self) -> bool {
        self.inner.config.auto_delete_previous
    }
}
