//! Fire-and-forget telemetry.
//!
//! Stats never gate the update pipeline: sends are spawned, failures are
//! logged and swallowed, and an empty `stats_url` disables the client.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::api;
use crate::config::UpdaterConfig;
use crate::store::Store;

/// Telemetry action names on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsAction {
    DownloadComplete,
    DownloadFail,
    Set,
    SetFail,
}

impl StatsAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatsAction::DownloadComplete => "download_complete",
            StatsAction::DownloadFail => "download_fail",
            StatsAction::Set => "set",
            StatsAction::SetFail => "set_fail",
        }
    }
}

/// Client for the stats endpoint.
#[derive(Clone)]
pub struct StatsClient {
    client: reqwest::Client,
    config: Arc<RwLock<UpdaterConfig>>,
    store: Arc<RwLock<Store>>,
    key_id: Option<String>,
}

impl StatsClient {
    pub fn new(
        client: reqwest::Client,
        config: Arc<RwLock<UpdaterConfig>>,
        store: Arc<RwLock<Store>>,
        key_id: Option<String>,
    ) -> Self {
        Self {
            client,
            config,
            store,
            key_id,
        }
    }

    /// Report one event. Never returns an error and never blocks the
    /// caller on anything but building the payload.
    pub async fn send(
        &self,
        action: StatsAction,
        version_name: &str,
        old_version_name: &str,
        bundle_id: Option<&str>,
        message: Option<&str>,
    ) {
        let (stats_url, info) = {
            let config = self.config.read().await;
            if config.stats_url.is_empty() {
                debug!(action = action.as_str(), "Stats disabled, dropping event");
                return;
            }
            let info = api::device_info(&config, &self.store, self.key_id.as_deref()).await;
            (config.stats_url.clone(), info)
        };

        let mut body = match serde_json::to_value(&info) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Could not build stats payload");
                return;
            }
        };
        body["action"] = json!(action.as_str());
        body["version_name"] = json!(version_name);
        body["old_version_name"] = json!(old_version_name);
        if let Some(id) = bundle_id {
            body["bundle_id"] = json!(id);
        }
        if let Some(message) = message {
            body["message"] = json!(message);
        }

        match self.client.post(&stats_url).json(&body).send().await {
            Ok(response) => {
                debug!(
                    action = action.as_str(),
                    status = response.status().as_u16(),
                    "Stats sent"
                );
            }
            Err(e) => {
                warn!(action = action.as_str(), error = %e, "Stats send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn stats_client(dir: &TempDir, stats_url: &str) -> (StatsClient, Arc<RwLock<Store>>) {
        let config = UpdaterConfig {
            user_data_dir: dir.path().to_path_buf(),
            stats_url: stats_url.to_string(),
            response_timeout_secs: 2,
            ..Default::default()
        };
        let client = api::build_client(&config).unwrap();
        let store = Arc::new(RwLock::new(Store::open(dir.path()).await));
        (
            StatsClient::new(client, Arc::new(RwLock::new(config)), store.clone(), None),
            store,
        )
    }

    #[test]
    fn test_action_wire_names() {
        assert_eq!(StatsAction::DownloadComplete.as_str(), "download_complete");
        assert_eq!(StatsAction::DownloadFail.as_str(), "download_fail");
        assert_eq!(StatsAction::Set.as_str(), "set");
        assert_eq!(StatsAction::SetFail.as_str(), "set_fail");
    }

    #[tokio::test]
    async fn test_send_swallows_transport_failures() {
        let dir = TempDir::new().unwrap();
        // Nothing listens here: the request fails fast.
        let (stats, store) = stats_client(&dir, "http://127.0.0.1:1/stats").await;

        stats
            .send(StatsAction::Set, "1.0.1", "builtin", Some("b-1"), None)
            .await;
        assert!(store.read().await.list_bundles().is_empty());
    }

    #[tokio::test]
    async fn test_empty_url_disables_client() {
        let dir = TempDir::new().unwrap();
        let (stats, _) = stats_client(&dir, "").await;

        stats
            .send(
                StatsAction::DownloadFail,
                "1.0.1",
                "builtin",
                None,
                Some("boom"),
            )
            .await;
    }
}
