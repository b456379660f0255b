//! Persistent bundle catalog: CRUD over installed bundle entries, status
//! transitions, and the at-most-one-active invariant
use crate::bundle::{BundleInfo, BundleStatus};
use crate::constants;
use crate::device::DeviceState;
use crate::error::{UpdateError, UpdateResult};
use crate::store::KeyValueStore;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Catalog of managed bundles, persisted one JSON entry per bundle id.
///
/// Every mutating call writes through to the store before returning, so a
/// process kill immediately after a successful call never loses the change.
/// Compound read-modify-write sequences are serialized under an internal
/// lock; lock scopes never span I/O awaits.
pub struct Catalog {
    store: Arc<dyn KeyValueStore>,
    device: Arc<DeviceState>,
    root: PathBuf,
    /// Ids with a live download this process; entries marked `Downloading`
    /// without one are leftovers from a killed process and get swept lazily
    in_flight: Mutex<HashSet<String>>,
    lock: Mutex<()>,
}

impl Catalog {
    pub fn new(store: Arc<dyn KeyValueStore>, device: Arc<DeviceState>, root: PathBuf) -> Self {
        Catalog {
            store,
            device,
            root,
            in_flight: Mutex::new(HashSet::new()),
            lock: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// All non-deleted entries, sorted by version name for stable display.
    /// Sweeps stale `Downloading` leftovers as a side effect.
    pub fn list(&self) -> Vec<BundleInfo> {
        self.sweep_stale_downloads();
        let mut bundles: Vec<BundleInfo> = self
            .store
            .keys_with_prefix(constants::BUNDLE_KEY_PREFIX)
            .iter()
            .filter_map(|key| self.read_entry_key(key))
            .filter(|b| !b.is_deleted())
            .collect();
        bundles.sort_by(|a, b| a.version_name.cmp(&b.version_name));
        bundles
    }

    /// Entry by id. The builtin sentinel resolves to its synthetic entry.
    /// Tombstoned (deleted) entries report `NotFound`.
    pub fn get(&self, id: &str) -> UpdateResult<BundleInfo> {
        if id == constants::BUILTIN_ID {
            return Ok(BundleInfo::builtin());
        }
        match self.read_entry(id) {
            Some(b) if !b.is_deleted() => Ok(b),
            _ => Err(UpdateError::NotFound(id.to_string())),
        }
    }

    /// Entry by version name, tombstones included so the orchestrator can
    /// distinguish "never seen" from "deleted, re-fetch required"
    pub fn get_by_version_name(&self, version_name: &str) -> Option<BundleInfo> {
        if version_name == constants::BUILTIN_VERSION {
            return Some(BundleInfo::builtin());
        }
        self.read_entry(&BundleInfo::id_for_version(version_name))
            .filter(|b| b.version_name == version_name)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Upsert, committed to durable storage before returning.
    /// The builtin sentinel is synthetic and may not be stored.
    pub fn put(&self, bundle: &BundleInfo) -> UpdateResult<()> {
        if bundle.is_builtin() {
            return Err(UpdateError::InvalidState(
                "builtin bundle cannot be stored".to_string(),
            ));
        }
        let json = serde_json::to_string(bundle).map_err(UpdateError::storage)?;
        self.store
            .put(&constants::bundle_key(&bundle.id), &json)
            .map_err(UpdateError::storage)
    }

    /// Checked status transition, persisted before returning
    pub fn set_status(&self, id: &str, to: BundleStatus) -> UpdateResult<BundleInfo> {
        let _guard = self.lock.lock().unwrap();
        let mut bundle = self.get(id)?;
        if !bundle.status.can_transition(to) {
            return Err(UpdateError::InvalidState(format!(
                "bundle {} cannot move {} -> {}",
                id, bundle.status, to
            )));
        }
        bundle.status = to;
        self.put(&bundle)?;
        Ok(bundle)
    }

    /// Atomic claim of a transition: succeeds only if the entry is still in
    /// `from`, so two racing claimants (readiness confirmation vs. guard
    /// expiry) cannot both win.
    pub fn claim_transition(
        &self,
        id: &str,
        from: BundleStatus,
        to: BundleStatus,
    ) -> UpdateResult<bool> {
        let _guard = self.lock.lock().unwrap();
        let mut bundle = self.get(id)?;
        if bundle.status != from {
            return Ok(false);
        }
        if !bundle.status.can_transition(to) {
            return Err(UpdateError::InvalidState(format!(
                "bundle {} cannot move {} -> {}",
                id, bundle.status, to
            )));
        }
        bundle.status = to;
        self.put(&bundle)?;
        Ok(true)
    }

    /// Removes the entry's files and tombstones it. Deleting the currently
    /// active bundle is rejected unless `force` (native-upgrade invalidation).
    pub fn delete(&self, id: &str, force: bool) -> UpdateResult<()> {
        if id == constants::BUILTIN_ID {
            return Err(UpdateError::InvalidState(
                "builtin bundle cannot be deleted".to_string(),
            ));
        }
        let _guard = self.lock.lock().unwrap();
        let bundle = match self.read_entry(id) {
            Some(b) if !b.is_deleted() => b,
            _ => return Err(UpdateError::NotFound(id.to_string())),
        };
        if !force && self.device.current_bundle_id() == id {
            return Err(UpdateError::InvalidState(format!(
                "bundle {} is active and cannot be deleted",
                id
            )));
        }
        self.remove_files(id);
        let mut tombstone = bundle;
        tombstone.status = BundleStatus::Deleted;
        tombstone.path = String::new();
        self.put(&tombstone)?;
        log::info!("Deleted bundle: {}", id);
        Ok(())
    }

    /// Drops an entry and its files entirely, tombstone included.
    /// Used before re-downloading a previously deleted or failed version.
    pub fn purge(&self, id: &str) -> UpdateResult<()> {
        let _guard = self.lock.lock().unwrap();
        self.remove_files(id);
        self.store
            .remove(&constants::bundle_key(id))
            .map_err(UpdateError::storage)
    }

    /// Resets current/next to the builtin sentinel; with `clear_all` also
    /// clears the one-shot delay flag
    pub fn reset(&self, clear_all: bool) -> UpdateResult<()> {
        let _guard = self.lock.lock().unwrap();
        self.device
            .set_current_bundle_id(constants::BUILTIN_ID)
            .map_err(UpdateError::storage)?;
        self.device
            .set_next_bundle_id(None)
            .map_err(UpdateError::storage)?;
        if clear_all {
            self.device
                .set_delay_update(false)
                .map_err(UpdateError::storage)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Download bookkeeping
    // ------------------------------------------------------------------

    /// Marks a download as live so the lazy sweep leaves its entry alone
    pub fn mark_in_flight(&self, id: &str) {
        self.in_flight.lock().unwrap().insert(id.to_string());
    }

    pub fn clear_in_flight(&self, id: &str) {
        self.in_flight.lock().unwrap().remove(id);
    }

    /// Purges entries stuck in `Downloading` with no live download (the
    /// process died mid-fetch) together with their partial files
    fn sweep_stale_downloads(&self) {
        let in_flight = self.in_flight.lock().unwrap().clone();
        for key in self.store.keys_with_prefix(constants::BUNDLE_KEY_PREFIX) {
            let Some(bundle) = self.read_entry_key(&key) else {
                continue;
            };
            if bundle.status == BundleStatus::Downloading && !in_flight.contains(&bundle.id) {
                log::warn!("Sweeping stale partial download: {}", bundle.id);
                if let Err(e) = self.purge(&bundle.id) {
                    log::error!("Failed to sweep {}: {}", bundle.id, e);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn read_entry(&self, id: &str) -> Option<BundleInfo> {
        self.read_entry_key(&constants::bundle_key(id))
    }

    fn read_entry_key(&self, key: &str) -> Option<BundleInfo> {
        let json = self.store.get(key)?;
        match sonic_rs::from_str(&json) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                log::error!("Corrupt catalog entry {}: {}", key, e);
                None
            }
        }
    }

    fn remove_files(&self, id: &str) {
        let dir = constants::bundle_dir(&self.root, id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                log::error!("Failed to remove bundle dir {}: {}", dir.display(), e);
            }
        }
        let part = constants::download_part_path(&self.root, id);
        if part.exists() {
            let _ = std::fs::remove_file(&part);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_catalog() -> Catalog {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let device = Arc::new(DeviceState::open(store.clone()).unwrap());
        let root = std::env::temp_dir().join(format!("otabundle-test-{}", uuid::Uuid::new_v4()));
        Catalog::new(store, device, root)
    }

    fn downloaded(version: &str) -> BundleInfo {
        let mut b = BundleInfo::new(version, "https://example.com/b.zip");
        b.status = BundleStatus::Downloaded;
        b
    }

    #[test]
    fn test_put_get_round_trip() {
        let catalog = test_catalog();
        let bundle = downloaded("1.0.0");
        catalog.put(&bundle).unwrap();
        let got = catalog.get(&bundle.id).unwrap();
        assert_eq!(got.version_name, "1.0.0");
        assert_eq!(got.status, BundleStatus::Downloaded);
        let by_name = catalog.get_by_version_name("1.0.0").unwrap();
        assert_eq!(by_name.id, bundle.id);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let catalog = test_catalog();
        assert!(matches!(
            catalog.get("nope"),
            Err(UpdateError::NotFound(_))
        ));
    }

    #[test]
    fn test_builtin_is_synthetic() {
        let catalog = test_catalog();
        let builtin = catalog.get(constants::BUILTIN_ID).unwrap();
        assert!(builtin.is_builtin());
        assert!(catalog.put(&builtin).is_err());
        assert!(catalog.delete(constants::BUILTIN_ID, true).is_err());
        // never listed
        assert!(catalog.list().is_empty());
    }

    #[test]
    fn test_delete_twice_reports_not_found() {
        let catalog = test_catalog();
        let bundle = downloaded("1.0.0");
        catalog.put(&bundle).unwrap();
        catalog.delete(&bundle.id, false).unwrap();
        assert!(matches!(
            catalog.delete(&bundle.id, false),
            Err(UpdateError::NotFound(_))
        ));
        // tombstone still visible by version name for the re-fetch decision
        let tomb = catalog.get_by_version_name("1.0.0").unwrap();
        assert!(tomb.is_deleted());
    }

    #[test]
    fn test_delete_active_requires_force() {
        let catalog = test_catalog();
        let bundle = downloaded("1.0.0");
        catalog.put(&bundle).unwrap();
        catalog.device.set_current_bundle_id(&bundle.id).unwrap();
        assert!(matches!(
            catalog.delete(&bundle.id, false),
            Err(UpdateError::InvalidState(_))
        ));
        catalog.delete(&bundle.id, true).unwrap();
    }

    #[test]
    fn test_claim_transition_single_winner() {
        let catalog = test_catalog();
        let mut bundle = downloaded("1.0.0");
        bundle.status = BundleStatus::Active;
        catalog.put(&bundle).unwrap();
        assert!(catalog
            .claim_transition(&bundle.id, BundleStatus::Active, BundleStatus::Success)
            .unwrap());
        // the losing claimant observes the moved status and backs off
        assert!(!catalog
            .claim_transition(&bundle.id, BundleStatus::Active, BundleStatus::Error)
            .unwrap());
        assert_eq!(catalog.get(&bundle.id).unwrap().status, BundleStatus::Success);
    }

    #[test]
    fn test_illegal_status_transition_rejected() {
        let catalog = test_catalog();
        let mut bundle = downloaded("1.0.0");
        bundle.status = BundleStatus::Downloading;
        catalog.put(&bundle).unwrap();
        catalog.mark_in_flight(&bundle.id);
        assert!(matches!(
            catalog.set_status(&bundle.id, BundleStatus::Active),
            Err(UpdateError::InvalidState(_))
        ));
    }

    #[test]
    fn test_stale_download_swept_on_list() {
        let catalog = test_catalog();
        let mut bundle = BundleInfo::new("9.9.9", "https://example.com/b.zip");
        bundle.status = BundleStatus::Downloading;
        catalog.put(&bundle).unwrap();
        // no in-flight marker: a previous process died mid-fetch
        assert!(catalog.list().is_empty());
        assert!(catalog.get_by_version_name("9.9.9").is_none());
    }

    #[test]
    fn test_sweep_spares_completed_download_until_unmarked() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let device = Arc::new(DeviceState::open(store.clone()).unwrap());
        let catalog = Catalog::new(store, device, dir.path().to_path_buf());

        let mut bundle = BundleInfo::new("2.0.0", "https://example.com/b.zip");
        catalog.mark_in_flight(&bundle.id);
        catalog.put(&bundle).unwrap();

        // the fetch materializes content while the entry is still Downloading
        let content_dir = constants::bundle_dir(dir.path(), &bundle.id);
        std::fs::create_dir_all(&content_dir).unwrap();
        std::fs::write(content_dir.join("bundle.bin"), b"payload").unwrap();

        // a poll thread lists mid-download: the marked entry must survive
        catalog.list();
        assert!(content_dir.join("bundle.bin").exists());

        // completion persists the finished entry before dropping the marker
        bundle.status = BundleStatus::Downloaded;
        bundle.path = content_dir.display().to_string();
        catalog.put(&bundle).unwrap();
        catalog.clear_in_flight(&bundle.id);

        // a later poll leaves the finished bundle and its content alone
        let listed = catalog.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, BundleStatus::Downloaded);
        assert!(content_dir.join("bundle.bin").exists());
    }

    #[test]
    fn test_reset_clears_pointers() {
        let catalog = test_catalog();
        catalog.device.set_current_bundle_id("x").unwrap();
        catalog.device.set_next_bundle_id(Some("y")).unwrap();
        catalog.device.set_delay_update(true).unwrap();
        catalog.reset(false).unwrap();
        assert_eq!(catalog.device.current_bundle_id(), constants::BUILTIN_ID);
        assert!(catalog.device.next_bundle_id().is_none());
        assert!(catalog.device.delay_update());
        catalog.reset(true).unwrap();
        assert!(!catalog.device.delay_update());
    }
}
