//! Readiness guard: single-shot timer racing the app's readiness
//! confirmation after every non-builtin activation
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

/// At most one guard is armed at a time; arming replaces any prior timer.
///
/// The guard only schedules the deadline. Winning the race is decided by an
/// atomic status claim in the catalog, so a confirmation arriving at the
/// same instant as expiry can never double-fire: the expiry body runs, finds
/// the claim already taken, and backs off.
pub struct ActivationGuard {
    armed: Mutex<Option<ArmedGuard>>,
}

struct ArmedGuard {
    bundle_id: String,
    task: JoinHandle<()>,
}

impl ActivationGuard {
    pub fn new() -> Self {
        ActivationGuard {
            armed: Mutex::new(None),
        }
    }

    /// Arms the deadline for `bundle_id`, cancelling any prior timer.
    /// `on_expire` runs once if the timer fires before `disarm`.
    pub fn arm<F, Fut>(&self, bundle_id: &str, timeout: Duration, on_expire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_expire().await;
        });
        let prior = self.armed.lock().unwrap().replace(ArmedGuard {
            bundle_id: bundle_id.to_string(),
            task,
        });
        if let Some(prior) = prior {
            log::debug!("Replacing armed guard for {}", prior.bundle_id);
            prior.task.abort();
        }
        log::info!(
            "Armed readiness guard for {} ({} ms)",
            bundle_id,
            timeout.as_millis()
        );
    }

    /// Cancels the armed timer, if any. Leaves bundle status untouched.
    pub fn disarm(&self) {
        if let Some(armed) = self.armed.lock().unwrap().take() {
            armed.task.abort();
            log::debug!("Disarmed readiness guard for {}", armed.bundle_id);
        }
    }

    /// Id the guard is currently armed for
    pub fn armed_for(&self) -> Option<String> {
        self.armed
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.bundle_id.clone())
    }
}

impl Default for ActivationGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        if let Some(armed) = self.armed.lock().unwrap().take() {
            armed.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_expiry_fires_once() {
        let guard = ActivationGuard::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        guard.arm("b1", Duration::from_millis(100), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(guard.armed_for().as_deref(), Some("b1"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_prevents_expiry() {
        let guard = ActivationGuard::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        guard.arm("b1", Duration::from_millis(100), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        guard.disarm();
        assert!(guard.armed_for().is_none());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_prior_timer() {
        let guard = ActivationGuard::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f1 = first.clone();
        guard.arm("b1", Duration::from_millis(100), move || async move {
            f1.fetch_add(1, Ordering::SeqCst);
        });
        let f2 = second.clone();
        guard.arm("b2", Duration::from_millis(100), move || async move {
            f2.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
