//! Lifecycle coordination: bridges host foreground/background signals to
//! update polling, deferred activation and rollback evaluation
use crate::bundle::BundleStatus;
use crate::updater::{StagingPolicy, Updater};

impl Updater {
    /// Foreground hook. Polls for updates in deferred mode when auto update
    /// is enabled (a foreground transition never activates anything) and
    /// re-arms the readiness guard for an unconfirmed current bundle.
    pub async fn on_foreground(&self) {
        if self.config().is_auto_update_enabled() {
            if let Err(e) = self.check_for_updates(StagingPolicy::Deferred).await {
                log::error!("Update check failed: {}", e);
            }
        }

        let current = self.current();
        if !current.is_builtin() && current.status != BundleStatus::Success {
            self.arm_guard(&current.id);
        }
    }

    /// Background hook: the single activation point for deferred updates.
    ///
    /// Order matters: the one-shot delay flag wins over everything, then a
    /// staged `next` bundle, then rollback of an unconfirmed current bundle,
    /// then cleanup after a confirmed one.
    pub fn on_background(&self) {
        log::info!("Checking for pending update");

        match self.device().take_delay_update() {
            Ok(true) => {
                log::info!("Update delayed to next backgrounding");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                log::error!("Failed to read delay flag: {}", e);
                return;
            }
        }

        let fallback = self.fallback();
        let current = self.current();
        log::debug!("Current bundle is: {}", current);
        log::debug!("Fallback bundle is: {}", fallback);

        if let Some(next) = self.next().filter(|n| !n.is_error() && n.id != current.id) {
            log::debug!("Next bundle is: {}", next.version_name);
            match self.set(&next.id) {
                Ok(()) => {
                    if let Err(e) = self.set_next(None) {
                        log::error!("Failed to clear staging pointer: {}", e);
                    }
                    log::info!("Updated to bundle: {}", next.version_name);
                }
                Err(e) => {
                    log::error!("Update to bundle {} failed: {}", next.version_name, e);
                }
            }
        } else if current.status != BundleStatus::Success && !current.is_builtin() {
            // nothing staged and the current bundle never confirmed readiness
            self.rollback_current(&current);
        } else if !fallback.is_builtin() && fallback.id != current.id {
            // current bundle confirmed; the previous fallback is now surplus
            log::info!("Bundle successfully loaded: {}", current);
            if self.auto_delete_previous() {
                log::info!("Deleting previous bundle: {}", fallback.version_name);
                if let Err(e) = self.delete(&fallback.id, false) {
                    log::error!(
                        "Failed to delete previous bundle {}: {}",
                        fallback.version_name,
                        e
                    );
                }
            }
        }
    }
}
