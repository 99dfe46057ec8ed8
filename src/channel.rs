//! Remote channel selection.
//!
//! The device can ask the update service to pin it to a named channel. The
//! chosen channel is cached locally so `get_channel` keeps answering when
//! the service is unreachable.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::api::{self, ChannelListEntry, ChannelListResponse, ChannelResponse};
use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateError};
use crate::store::Store;

/// Client for the channel endpoint.
#[derive(Clone)]
pub struct ChannelClient {
    client: reqwest::Client,
    config: Arc<RwLock<UpdaterConfig>>,
    store: Arc<RwLock<Store>>,
    key_id: Option<String>,
}

impl ChannelClient {
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

    async fn endpoint(&self) -> String {
        self.config.read().await.channel_url.clone()
    }

    async fn info(&self) -> api::DeviceInfo {
        let config = self.config.read().await;
        api::device_info(&config, &self.store, self.key_id.as_deref()).await
    }

    async fn info_body(&self, action: &str) -> Result<serde_json::Value> {
        let mut body = serde_json::to_value(&self.info().await)?;
        body["action"] = json!(action);
        Ok(body)
    }

    /// Ask the server to pin this device to `channel`; persist locally only
    /// when the server acknowledges.
    #[instrument(skip(self))]
    pub async fn set_channel(&self, channel: &str) -> Result<ChannelResponse> {
        let mut body = self.info_body("set").await?;
        body["channel"] = json!(channel);

        let url = self.endpoint().await;
        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::HttpStatus {
                status: response.status().as_u16(),
                url,
            });
        }
        let parsed: ChannelResponse = response.json().await?;

        if matches!(parsed.status.as_deref(), Some("ok") | Some("success")) {
            let mut store = self.store.write().await;
            store.set_channel(Some(channel.to_string()));
            store.save().await?;
            info!(channel = %channel, "Channel set");
        } else {
            warn!(channel = %channel, error = ?parsed.error, "Server refused channel");
        }
        Ok(parsed)
    }

    /// Drop the channel pin. Server errors are ignored; the local cache is
    /// always cleared.
    #[instrument(skip(self))]
    pub async fn unset_channel(&self) -> Result<()> {
        match self.info_body("unset").await {
            Ok(body) => {
                let url = self.endpoint().await;
                if let Err(e) = self.client.post(&url).json(&body).send().await {
                    warn!(error = %e, "Channel unset request failed, clearing locally");
                }
            }
            Err(e) => warn!(error = %e, "Could not build unset payload"),
        }

        let mut store = self.store.write().await;
        store.set_channel(None);
        store.save().await?;
        info!("Channel cleared");
        Ok(())
    }

    /// Current channel as the server sees it, falling back to the local
    /// cache on any transport failure.
    pub async fn get_channel(&self) -> ChannelResponse {
        let info = self.info().await;
        let url = self.endpoint().await;
        let result = async {
            let response = self.client.get(&url).query(&info).send().await?;
            response.json::<ChannelResponse>().await
        }
        .await;

        match result {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Channel lookup failed, using local cache");
                let local = self.store.read().await.channel().map(str::to_string);
                let default = self.config.read().await.default_channel.clone();
                ChannelResponse {
                    status: Some("ok".to_string()),
                    channel: local.or(default),
                    allow_set: Some(true),
                    ..Default::default()
                }
            }
        }
    }

    /// Channels the server offers. Empty on any failure.
    pub async fn list_channels(&self) -> Vec<ChannelListEntry> {
        let info = self.info().await;
        let url = self.endpoint().await;
        let result = async {
            let response = self
                .client
                .get(&url)
                .query(&[("action", "list")])
                .query(&info)
                .send()
                .await?;
            response.json::<ChannelListResponse>().await
        }
        .await;

        match result {
            Ok(parsed) => parsed.channels,
            Err(e) => {
                warn!(error = %e, "Channel listing failed");
                Vec::new()
            }
        }
    }
}
