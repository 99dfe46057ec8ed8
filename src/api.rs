//! Wire types shared by the update, channel and stats endpoints.
//!
//! The remote service predates desktop support and keys its behavior off a
//! mobile platform tag, so every request carries the literal `"android"`.
//! Responses are loosely typed JSON; unknown fields are ignored and every
//! field we read is defaulted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::UpdaterConfig;
use crate::error::Result;
use crate::store::{Store, BUILTIN_ID};

/// Platform tag the server expects. Changing this requires a server update
/// shipped in tandem.
pub const PLATFORM: &str = "android";

/// Version of this updater, reported as `plugin_version`.
pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sentinel error string meaning the device already runs the latest bundle.
pub const NO_NEW_VERSION: &str = "no_new_version_available";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 10;

/// Build the HTTP client every component shares the settings of: hard
/// request deadline, bounded redirects, identifying user agent.
pub fn build_client(config: &UpdaterConfig) -> Result<reqwest::Client> {
    let app_id = if config.app_id.is_empty() {
        "missing-app-id"
    } else {
        &config.app_id
    };
    let user_agent = format!(
        "CapacitorUpdater/{PLUGIN_VERSION} ({app_id}) electron/{}",
        config.version_os
    );

    let client = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(Duration::from_secs(config.response_timeout_secs))
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .build()?;
    Ok(client)
}

/// Identification payload attached to every request.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub platform: &'static str,
    pub device_id: String,
    pub app_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    pub version_build: String,
    pub version_code: String,
    pub version_os: String,
    /// Version name of the bundle the device currently runs.
    pub version_name: String,
    pub plugin_version: &'static str,
    pub is_emulator: bool,
    pub is_prod: bool,
    #[serde(rename = "defaultChannel", skip_serializing_if = "Option::is_none")]
    pub default_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// Gather the device info payload from configuration and persisted state.
pub async fn device_info(
    config: &UpdaterConfig,
    store: &RwLock<Store>,
    key_id: Option<&str>,
) -> DeviceInfo {
    let mut store = store.write().await;
    let device_id = store.device_id();
    let custom_id = store.custom_id().map(str::to_string);

    let version_name = store
        .current_bundle_id()
        .filter(|id| *id != BUILTIN_ID)
        .and_then(|id| store.get_bundle(id))
        .map(|b| b.version.clone())
        .unwrap_or_else(|| config.builtin_version.clone());

    DeviceInfo {
        platform: PLATFORM,
        device_id,
        app_id: config.app_id.clone(),
        custom_id,
        version_build: config.version_build.clone(),
        version_code: config.version_code.clone(),
        version_os: config.version_os.clone(),
        version_name,
        plugin_version: PLUGIN_VERSION,
        is_emulator: false,
        is_prod: config.is_prod,
        default_channel: config.default_channel.clone(),
        key_id: key_id.map(str::to_string),
    }
}

/// One file of a manifest (delta) update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file_name: String,
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
}

/// Answer of the update endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LatestResponse {
    pub version: Option<String>,
    pub url: Option<String>,
    pub checksum: Option<String>,
    #[serde(rename = "sessionKey")]
    pub session_key: Option<String>,
    #[serde(default)]
    pub manifest: Vec<ManifestEntry>,
    pub breaking: Option<bool>,
    pub error: Option<String>,
    pub message: Option<String>,
}

/// Answer of the channel endpoint for set/unset/get.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelResponse {
    pub status: Option<String>,
    pub error: Option<String>,
    pub message: Option<String>,
    pub channel: Option<String>,
    pub allow_set: Option<bool>,
}

/// One entry of the channel listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelListEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub allow_self_set: bool,
}

/// Answer of the channel endpoint for `action=list`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelListResponse {
    #[serde(default)]
    pub channels: Vec<ChannelListEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BundleInfo, BundleStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_device_info_wire_shape() {
        let dir = TempDir::new().unwrap();
        let config = UpdaterConfig {
            app_id: "com.demo.app".to_string(),
            default_channel: Some("production".to_string()),
            user_data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = RwLock::new(Store::open(dir.path()).await);

        let info = device_info(&config, &store, Some("MIIBIjANBgkqhkiG9w0B")).await;
        let json = serde_json::to_value(&info).unwrap();

        assert_eq!(json["platform"], "android");
        assert_eq!(json["app_id"], "com.demo.app");
        assert_eq!(json["defaultChannel"], "production");
        assert_eq!(json["is_emulator"], false);
        assert_eq!(json["version_name"], "builtin");
        assert!(json.get("custom_id").is_none());
        assert_eq!(json["plugin_version"], PLUGIN_VERSION);
    }

    #[tokio::test]
    async fn test_device_info_uses_current_bundle_version() {
        let dir = TempDir::new().unwrap();
        let config = UpdaterConfig {
            user_data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = RwLock::new(Store::open(dir.path()).await);
        {
            let mut s = store.write().await;
            s.set_bundle(BundleInfo::new("b-1", "2.5.0", "c", BundleStatus::Success));
            s.set_current_bundle_id(Some("b-1".to_string()));
        }

        let info = device_info(&config, &store, None).await;
        assert_eq!(info.version_name, "2.5.0");
        assert!(info.key_id.is_none());
    }

    #[test]
    fn test_latest_response_tolerates_sparse_json() {
        let parsed: LatestResponse =
            serde_json::from_str(r#"{"error":"no_new_version_available","extra":42}"#).unwrap();
        assert_eq!(parsed.error.as_deref(), Some(NO_NEW_VERSION));
        assert!(parsed.manifest.is_empty());

        let parsed: LatestResponse = serde_json::from_str(
            r#"{"version":"1.0.1","url":"https://host/b.zip","sessionKey":"aXY=:a2V5",
                "manifest":[{"file_name":"www/index.html","download_url":"https://host/f"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.session_key.as_deref(), Some("aXY=:a2V5"));
        assert_eq!(parsed.manifest.len(), 1);
        assert!(parsed.manifest[0].file_hash.is_none());
    }
}
