//! HTTP client half of the orchestrator: manifest checks, artifact
//! downloads with progress and checksum, fire-and-forget stats reports
use crate::constants;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

// ============================================================================
// Wire Shapes
// ============================================================================

/// Manifest endpoint reply. Exactly one of three shapes in practice:
/// `{error}`, `{message, major?, version?}`, or `{url, version, ...}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LatestResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub major: Option<bool>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "sessionKey")]
    pub session_key: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Device identification sent with manifest checks and stats reports
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub platform: String,
    pub device_id: String,
    pub app_id: String,
    pub version_name: String,
    pub version_native: String,
    pub plugin_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

pub struct RemoteClient {
    client: reqwest::Client,
}

impl RemoteClient {
    pub fn new() -> Result<Self> {
        Ok(RemoteClient {
            client: reqwest::Client::builder()
                .user_agent(constants::user_agent())
                .build()?,
        })
    }

    /// Queries the manifest endpoint with the device info payload
    pub async fn get_latest(&self, url: &str, info: &DeviceInfo) -> Result<LatestResponse> {
        let response = self
            .client
            .post(url)
            .timeout(Duration::from_secs(constants::HTTP_MANIFEST_TIMEOUT_SECS))
            .json(info)
            .send()
            .await
            .context("Failed to reach manifest endpoint")?;

        if !response.status().is_success() {
            anyhow::bail!("Manifest request failed: {}", response.status());
        }

        let body = response.text().await?;
        let latest: LatestResponse =
            sonic_rs::from_str(&body).context("Failed to parse manifest JSON")?;
        Ok(latest)
    }

    /// Streams an artifact to `dest`, reporting percent progress, and
    /// returns the sha256 hex digest of the bytes written.
    ///
    /// The session key travels as a header; decryption itself is the
    /// artifact pipeline's concern, the token is opaque here.
    pub async fn download_to(
        &self,
        url: &str,
        session_key: Option<&str>,
        dest: &Path,
        progress: impl Fn(u8),
    ) -> Result<String> {
        // Reject malformed URLs before opening a connection
        reqwest::Url::parse(url).with_context(|| format!("Invalid download URL: {}", url))?;

        let mut request = self
            .client
            .get(url)
            .timeout(Duration::from_secs(constants::HTTP_DOWNLOAD_TIMEOUT_SECS));
        if let Some(key) = session_key {
            if !key.is_empty() {
                request = request.header("x-session-key", key);
            }
        }

        let mut response = request.send().await.context("Failed to start download")?;
        if !response.status().is_success() {
            anyhow::bail!("Download failed: {}", response.status());
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        let total = response.content_length().unwrap_or(0);
        let mut written: u64 = 0;
        let mut last_percent: u8 = 0;
        let mut hasher = Sha256::new();

        progress(0);
        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if total > 0 {
                let percent = ((written * 100) / total).min(100) as u8;
                // report in 10% steps to keep the host callback quiet
                if percent / 10 > last_percent / 10 {
                    last_percent = percent;
                    progress(percent);
                }
            }
        }
        file.flush().await?;
        progress(100);

        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Best-effort stats report; spawned so callers never wait on it and
    /// failures are only logged
    pub fn send_stats(&self, stats_url: &str, action: &str, info: &DeviceInfo) {
        if stats_url.is_empty() {
            return;
        }
        let client = self.client.clone();
        let url = stats_url.to_string();
        let mut payload = info.clone();
        payload.action = Some(action.to_string());
        let action = action.to_string();
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .timeout(Duration::from_secs(constants::HTTP_STATS_TIMEOUT_SECS))
                .json(&payload)
                .send()
                .await;
            match result {
                Ok(r) if r.status().is_success() => {
                    log::debug!("Reported stats '{}' for {}", action, payload.version_name)
                }
                Ok(r) => log::warn!("Stats endpoint returned {}", r.status()),
                Err(e) => log::warn!("Failed to report stats '{}': {}", action, e),
            }
        });
    }
}
