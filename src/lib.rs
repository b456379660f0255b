//! otabundle: over-the-air bundle lifecycle manager for hybrid apps.
//!
//! Keeps a persistent catalog of downloaded content bundles, stages updates
//! fetched from a manifest endpoint, activates them at safe lifecycle
//! boundaries and rolls back automatically when the running app never
//! confirms a new bundle booted correctly. All consistency is self-managed
//! on top of a flat key-value store and a content directory; every mutation
//! is durable before the call returns.

pub mod bundle;
pub mod catalog;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod guard;
pub mod host;
pub mod lifecycle;
pub mod remote;
pub mod store;
pub mod updater;

pub use bundle::{BundleInfo, BundleStatus};
pub use catalog::Catalog;
pub use config::UpdaterConfig;
pub use device::DeviceState;
pub use error::{UpdateError, UpdateResult};
pub use host::{HostEvents, NoopHost};
pub use remote::{DeviceInfo, LatestResponse, RemoteClient};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use updater::{StagingPolicy, Updater};
