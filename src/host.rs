//! Host application seam: content reload plus event notifications
use crate::bundle::BundleInfo;
use anyhow::Result;
use std::path::Path;

/// Callbacks into the host application.
///
/// `reload` points the host's content view at a bundle directory (or the
/// builtin assets when `path` is `None`); the remaining hooks mirror the
/// events a host typically surfaces to application code and default to
/// no-ops.
pub trait HostEvents: Send + Sync {
    /// Point the content view at `path`, or at the builtin assets for `None`
    fn reload(&self, path: Option<&Path>) -> Result<()>;

    /// Download progress for a bundle, percent in 0..=100
    fn on_download_progress(&self, _id: &str, _percent: u8) {}

    /// A bundle finished downloading and is staged for the next activation
    fn on_update_available(&self, _bundle: &BundleInfo) {}

    /// The manifest announced a new major version without offering a download
    fn on_major_available(&self, _version: &str) {}

    /// The active bundle missed its readiness deadline and was rolled back
    fn on_update_failed(&self, _bundle: &BundleInfo) {}
}

/// Host that accepts every reload and drops every event; useful for tests
/// and headless embedders
#[derive(Default)]
pub struct NoopHost;

impl HostEvents for NoopHost {
    fn reload(&self, path: Option<&Path>) -> Result<()> {
        log::debug!("reload -> {:?}", path);
        Ok(())
    }
}
