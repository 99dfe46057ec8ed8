//! Persistent updater state.
//!
//! A single JSON file at `<userData>/electron-updater-storage.json` holds the
//! bundle registry, the current/next/fallback pointers, device identity and
//! the mutable service URLs. The file is loaded once at startup and rewritten
//! atomically (temp file + rename) on every mutation that must survive a
//! restart. A load failure yields an empty store: fresh-install semantics.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::delay::DelayCondition;
use crate::error::Result;

/// Reserved id of the bundle shipped in the host installer.
pub const BUILTIN_ID: &str = "builtin";

/// File name of the storage file inside the user-data directory.
pub const STORAGE_FILE: &str = "electron-updater-storage.json";

/// Directory name of the bundles tree inside the user-data directory.
pub const BUNDLES_DIR: &str = "capgo-bundles";

/// Lifecycle status of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Downloading,
    Pending,
    Error,
    Success,
    Deleted,
}

impl std::fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleStatus::Downloading => write!(f, "downloading"),
            BundleStatus::Pending => write!(f, "pending"),
            BundleStatus::Error => write!(f, "error"),
            BundleStatus::Success => write!(f, "success"),
            BundleStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// Metadata for one installed (or in-flight) bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleInfo {
    /// Stable opaque identifier. `"builtin"` is reserved.
    pub id: String,
    /// Version name supplied by the server.
    pub version: String,
    /// Install completion timestamp.
    pub downloaded: DateTime<Utc>,
    /// Hex digest of the delivered archive, post-decrypt.
    pub checksum: String,
    /// Lifecycle status.
    pub status: BundleStatus,
}

impl BundleInfo {
    pub fn new(
        id: impl Into<String>,
        version: impl Into<String>,
        checksum: impl Into<String>,
        status: BundleStatus,
    ) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            downloaded: Utc::now(),
            checksum: checksum.into(),
            status,
        }
    }

    /// Whether this record describes the builtin bundle.
    pub fn is_builtin(&self) -> bool {
        self.id == BUILTIN_ID
    }
}

/// On-disk shape of the storage file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StoreData {
    bundles: HashMap<String, BundleInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_bundle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_bundle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fallback_bundle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    update_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    delay_conditions: Vec<DelayCondition>,
    kill_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    native_version: Option<String>,
}

/// Process-wide persistent key-value store.
///
/// The store itself performs no locking; the coordinator owns it behind a
/// `tokio::sync::RwLock` and serializes mutation.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    data: StoreData,
}

impl Store {
    /// Load the store from `<user_data_dir>/electron-updater-storage.json`.
    ///
    /// Any read or parse failure produces an empty in-memory store.
    pub async fn open(user_data_dir: &Path) -> Self {
        let path = user_data_dir.join(STORAGE_FILE);
        let data = match fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<StoreData>(&raw) {
                Ok(data) => {
                    debug!(path = %path.display(), bundles = data.bundles.len(), "Storage loaded");
                    data
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt storage file, starting fresh");
                    StoreData::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No storage file, starting fresh");
                StoreData::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read storage file, starting fresh");
                StoreData::default()
            }
        };
        Self { path, data }
    }

    /// Persist the current state atomically: write a temp file next to the
    /// target, then rename over it.
    pub async fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.data)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Storage saved");
        Ok(())
    }

    // --- bundle registry ---

    pub fn get_bundle(&self, id: &str) -> Option<&BundleInfo> {
        self.data.bundles.get(id)
    }

    pub fn set_bundle(&mut self, bundle: BundleInfo) {
        self.data.bundles.insert(bundle.id.clone(), bundle);
    }

    pub fn remove_bundle(&mut self, id: &str) -> Option<BundleInfo> {
        self.data.bundles.remove(id)
    }

    pub fn list_bundles(&self) -> Vec<BundleInfo> {
        let mut bundles: Vec<_> = self.data.bundles.values().cloned().collect();
        bundles.sort_by(|a, b| a.downloaded.cmp(&b.downloaded));
        bundles
    }

    pub fn set_bundle_status(&mut self, id: &str, status: BundleStatus) -> bool {
        match self.data.bundles.get_mut(id) {
            Some(bundle) => {
                bundle.status = status;
                true
            }
            None => false,
        }
    }

    // --- pointers ---

    pub fn current_bundle_id(&self) -> Option<&str> {
        self.data.current_bundle_id.as_deref()
    }

    pub fn set_current_bundle_id(&mut self, id: Option<String>) {
        self.data.current_bundle_id = id;
    }

    pub fn next_bundle_id(&self) -> Option<&str> {
        self.data.next_bundle_id.as_deref()
    }

    pub fn set_next_bundle_id(&mut self, id: Option<String>) {
        self.data.next_bundle_id = id;
    }

    pub fn fallback_bundle_id(&self) -> Option<&str> {
        self.data.fallback_bundle_id.as_deref()
    }

    pub fn set_fallback_bundle_id(&mut self, id: Option<String>) {
        self.data.fallback_bundle_id = id;
    }

    // --- device identity ---

    /// Stable device identifier, generated on first read.
    pub fn device_id(&mut self) -> String {
        match &self.data.device_id {
            Some(id) => id.clone(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                info!(device_id = %id, "Generated device id");
                self.data.device_id = Some(id.clone());
                id
            }
        }
    }

    pub fn custom_id(&self) -> Option<&str> {
        self.data.custom_id.as_deref()
    }

    pub fn set_custom_id(&mut self, id: Option<String>) {
        self.data.custom_id = id;
    }

    // --- channel ---

    pub fn channel(&self) -> Option<&str> {
        self.data.channel.as_deref()
    }

    pub fn set_channel(&mut self, channel: Option<String>) {
        self.data.channel = channel;
    }

    // --- mutable configuration ---

    pub fn update_url(&self) -> Option<&str> {
        self.data.update_url.as_deref()
    }

    pub fn set_update_url(&mut self, url: Option<String>) {
        self.data.update_url = url;
    }

    pub fn channel_url(&self) -> Option<&str> {
        self.data.channel_url.as_deref()
    }

    pub fn set_channel_url(&mut self, url: Option<String>) {
        self.data.channel_url = url;
    }

    pub fn stats_url(&self) -> Option<&str> {
        self.data.stats_url.as_deref()
    }

    pub fn set_stats_url(&mut self, url: Option<String>) {
        self.data.stats_url = url;
    }

    pub fn app_id(&self) -> Option<&str> {
        self.data.app_id.as_deref()
    }

    pub fn set_app_id(&mut self, app_id: Option<String>) {
        self.data.app_id = app_id;
    }

    // --- delay state ---

    pub fn delay_conditions(&self) -> &[DelayCondition] {
        &self.data.delay_conditions
    }

    pub fn set_delay_conditions(&mut self, conditions: Vec<DelayCondition>) {
        self.data.delay_conditions = conditions;
    }

    pub fn kill_pending(&self) -> bool {
        self.data.kill_pending
    }

    pub fn set_kill_pending(&mut self, pending: bool) {
        self.data.kill_pending = pending;
    }

    // --- native version tracking ---

    pub fn native_version(&self) -> Option<&str> {
        self.data.native_version.as_deref()
    }

    pub fn set_native_version(&mut self, version: Option<String>) {
        self.data.native_version = version;
    }
}
