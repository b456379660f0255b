use anyhow::Result;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use otabundle::{
    BundleInfo, BundleStatus, Catalog, DeviceState, HostEvents, KeyValueStore, MemoryStore,
    Updater, UpdaterConfig,
};

// ============================================================================
// Recording Host
// ============================================================================

/// Host double that records every reload and event for assertions
#[derive(Default)]
pub struct RecordingHost {
    pub reloads: Mutex<Vec<Option<PathBuf>>>,
    pub updates_available: Mutex<Vec<String>>,
    pub majors_available: Mutex<Vec<String>>,
    pub updates_failed: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<(String, u8)>>,
}

impl HostEvents for RecordingHost {
    fn reload(&self, path: Option<&std::path::Path>) -> Result<()> {
        self.reloads.lock().unwrap().push(path.map(|p| p.to_path_buf()));
        Ok(())
    }

    fn on_download_progress(&self, id: &str, percent: u8) {
        self.progress.lock().unwrap().push((id.to_string(), percent));
    }

    fn on_update_available(&self, bundle: &BundleInfo) {
        self.updates_available
            .lock()
            .unwrap()
            .push(bundle.version_name.clone());
    }

    fn on_major_available(&self, version: &str) {
        self.majors_available.lock().unwrap().push(version.to_string());
    }

    fn on_update_failed(&self, bundle: &BundleInfo) {
        self.updates_failed
            .lock()
            .unwrap()
            .push(bundle.version_name.clone());
    }
}

// ============================================================================
// Fixture
// ============================================================================

pub struct Fixture {
    pub updater: Updater,
    pub store: Arc<MemoryStore>,
    pub host: Arc<RecordingHost>,
    pub dir: TempDir,
}

pub fn test_config() -> UpdaterConfig {
    UpdaterConfig {
        auto_update: true,
        // far enough out that it never fires mid-test; guard tests override
        app_ready_timeout: 60_000,
        version_native: "1.0.0".to_string(),
        app_id: "com.example.app".to_string(),
        ..Default::default()
    }
}

pub fn fixture_with(config: UpdaterConfig) -> Result<Fixture> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryStore::new());
    let host = Arc::new(RecordingHost::default());
    let updater = Updater::with_store(
        dir.path().to_path_buf(),
        config,
        store.clone(),
        host.clone(),
    )?;
    Ok(Fixture {
        updater,
        store,
        host,
        dir,
    })
}

#[allow(dead_code)]
pub fn fixture() -> Result<Fixture> {
    fixture_with(test_config())
}

/// Plants a catalog entry directly through the store, bypassing the network
#[allow(dead_code)]
pub fn seed_bundle(fixture: &Fixture, version: &str, status: BundleStatus) -> Result<BundleInfo> {
    let store: Arc<dyn KeyValueStore> = fixture.store.clone();
    let device = Arc::new(DeviceState::open(store.clone())?);
    let catalog = Catalog::new(store, device, fixture.dir.path().to_path_buf());

    let mut bundle = BundleInfo::new(version, "https://cdn.example.com/seed.zip");
    let dir = fixture.dir.path().join("bundles").join(&bundle.id);
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("bundle.bin"), b"seeded")?;
    bundle.status = status;
    bundle.path = dir.to_string_lossy().into_owned();
    bundle.downloaded = chrono::Utc::now().to_rfc3339();
    catalog.put(&bundle)?;
    Ok(bundle)
}

#[allow(dead_code)]
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

// ============================================================================
// Fixture HTTP Server
// ============================================================================

/// Serves a canned manifest reply and one artifact, counting artifact hits
#[allow(dead_code)]
pub struct FixtureServer {
    pub base_url: String,
    pub manifest_url: String,
    pub artifact_url: String,
    pub artifact_hits: Arc<AtomicUsize>,
}

#[allow(dead_code)]
pub async fn start_fixture_server(
    manifest: serde_json::Value,
    artifact: Vec<u8>,
) -> Result<FixtureServer> {
    use axum::routing::{get, post};
    use axum::{Json, Router};

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_route = hits.clone();
    let app = Router::new()
        .route(
            "/updates",
            post(move || {
                let manifest = manifest.clone();
                async move { Json(manifest) }
            }),
        )
        .route(
            "/bundle.zip",
            get(move || {
                let artifact = artifact.clone();
                let hits = hits_route.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    artifact
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let base_url = format!("http://{}", addr);
    Ok(FixtureServer {
        manifest_url: format!("{}/updates", base_url),
        artifact_url: format!("{}/bundle.zip", base_url),
        base_url,
        artifact_hits: hits,
    })
}
