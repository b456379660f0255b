//! Process-wide persisted device state: id, current/next pointers, flags
use crate::constants;
use crate::store::KeyValueStore;
use anyhow::Result;
use std::sync::Arc;

/// Persisted pointers and flags shared by every operation.
///
/// Each accessor reads/writes straight through to the store so the values
/// survive a kill at any point. Compound sequences (read-and-clear, pointer
/// swaps) are serialized by the `Updater`, not here.
pub struct DeviceState {
    store: Arc<dyn KeyValueStore>,
}

impl DeviceState {
    /// Opens the device state, generating a device id on first run
    pub fn open(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let state = DeviceState { store };
        if state.store.get(constants::KEY_DEVICE_ID).is_none() {
            let id = uuid::Uuid::new_v4().to_string();
            state.store.put(constants::KEY_DEVICE_ID, &id)?;
            log::info!("Generated device id: {}", id);
        }
        Ok(state)
    }

    pub fn device_id(&self) -> String {
        // open() guarantees the key exists
        self.store.get(constants::KEY_DEVICE_ID).unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Current / next bundle pointers
    // ------------------------------------------------------------------

    /// Id of the bundle currently serving content; builtin if never set
    pub fn current_bundle_id(&self) -> String {
        self.store
            .get(constants::KEY_CURRENT_BUNDLE)
            .unwrap_or_else(|| constants::BUILTIN_ID.to_string())
    }

    pub fn set_current_bundle_id(&self, id: &str) -> Result<()> {
        self.store.put(constants::KEY_CURRENT_BUNDLE, id)
    }

    /// Id staged for activation at the next background boundary, if any
    pub fn next_bundle_id(&self) -> Option<String> {
        self.store.get(constants::KEY_NEXT_BUNDLE).filter(|s| !s.is_empty())
    }

    pub fn set_next_bundle_id(&self, id: Option<&str>) -> Result<()> {
        match id {
            Some(id) => self.store.put(constants::KEY_NEXT_BUNDLE, id),
            None => self.store.remove(constants::KEY_NEXT_BUNDLE),
        }
    }

    // ------------------------------------------------------------------
    // One-shot delay flag
    // ------------------------------------------------------------------

    pub fn delay_update(&self) -> bool {
        self.store.get(constants::KEY_DELAY_UPDATE).as_deref() == Some("true")
    }

    pub fn set_delay_update(&self, delay: bool) -> Result<()> {
        if delay {
            self.store.put(constants::KEY_DELAY_UPDATE, "true")
        } else {
            self.store.remove(constants::KEY_DELAY_UPDATE)
        }
    }

    /// Reads the delay flag and clears it in the same step
    pub fn take_delay_update(&self) -> Result<bool> {
        let delayed = self.delay_update();
        if delayed {
            self.store.remove(constants::KEY_DELAY_UPDATE)?;
        }
        Ok(delayed)
    }

    // ------------------------------------------------------------------
    // Native version bookkeeping
    // ------------------------------------------------------------------

    pub fn last_native_version(&self) -> Option<String> {
        self.store
            .get(constants::KEY_LAST_NATIVE_VERSION)
            .filter(|s| !s.is_empty())
    }

    pub fn set_last_native_version(&self, version: &str) -> Result<()> {
        self.store.put(constants::KEY_LAST_NATIVE_VERSION, version)
    }
}
