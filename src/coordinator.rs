//! Update orchestration.
//!
//! The [`Updater`] wires the store, downloader, registry, delay controller
//! and the two service clients together: it answers host calls
//! (`check_for_updates`, `set`, `notify_app_ready`, window focus hooks),
//! runs the periodic background check, and owns the app-ready watchdog that
//! rolls a freshly promoted bundle back when the host never confirms it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::api::{self, LatestResponse, NO_NEW_VERSION};
use crate::channel::ChannelClient;
use crate::config::UpdaterConfig;
use crate::crypto::Crypto;
use crate::delay::{DelayCondition, DelayController};
use crate::download::{DownloadRequest, Downloader, ProgressFn};
use crate::error::{Result, UpdateError};
use crate::events::{EventBus, UpdaterEvent};
use crate::host::HostIntegration;
use crate::registry::BundleRegistry;
use crate::stats::{StatsAction, StatsClient};
use crate::store::{BundleInfo, BundleStatus, Store};

/// Coordinates the full update lifecycle for one host process.
pub struct Updater {
    config: Arc<RwLock<UpdaterConfig>>,
    client: reqwest::Client,
    store: Arc<RwLock<Store>>,
    crypto: Arc<Crypto>,
    downloader: Downloader,
    registry: BundleRegistry,
    delay: DelayController,
    channels: ChannelClient,
    stats: StatsClient,
    events: EventBus,
    host: Arc<dyn HostIntegration>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    periodic: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl Updater {
    /// Build all components. Persisted URL overrides are overlaid onto the
    /// supplied configuration before anything is constructed.
    pub async fn new(
        mut config: UpdaterConfig,
        host: Arc<dyn HostIntegration>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(UpdateError::Config)?;

        let store = Store::open(&config.user_data_dir).await;
        let store = Arc::new(RwLock::new(store));
        {
            let mut store = store.write().await;
            if config.persist_modify_url {
                if let Some(url) = store.update_url() {
                    config.update_url = url.to_string();
                }
                if let Some(url) = store.channel_url() {
                    config.channel_url = url.to_string();
                }
                if let Some(url) = store.stats_url() {
                    config.stats_url = url.to_string();
                }
                if let Some(app_id) = store.app_id() {
                    config.app_id = app_id.to_string();
                }
            }
            if !config.persist_custom_id && store.custom_id().is_some() {
                store.set_custom_id(None);
            }
        }

        let crypto = Arc::new(Crypto::new(config.public_key.as_deref())?);
        let key_id = crypto.key_id().map(str::to_string);
        let client = api::build_client(&config)?;

        let downloader = Downloader::new(&config, client.clone(), store.clone(), crypto.clone());
        let registry = BundleRegistry::new(&config, store.clone());
        let delay = DelayController::new(store.clone(), config.version_build.clone());

        let config = Arc::new(RwLock::new(config));
        let channels = ChannelClient::new(
            client.clone(),
            config.clone(),
            store.clone(),
            key_id.clone(),
        );
        let stats = StatsClient::new(client.clone(), config.clone(), store.clone(), key_id);

        Ok(Arc::new(Self {
            config,
            client,
            store,
            crypto,
            downloader,
            registry,
            delay,
            channels,
            stats,
            events: EventBus::new(),
            host,
            watchdog: Mutex::new(None),
            periodic: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }))
    }

    /// One-shot startup: device identity, delay bookkeeping, native-upgrade
    /// reset, one gate attempt and the periodic schedule. Calling it again
    /// is a no-op.
    #[instrument(skip(self))]
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("Updater already initialized");
            return Ok(());
        }
        info!(version = api::PLUGIN_VERSION, "Initializing updater");

        {
            let mut store = self.store.write().await;
            store.device_id();
            store.save().await?;
        }

        self.delay.on_app_start().await?;

        let reset_when_update = self.config.read().await.reset_when_update;
        if reset_when_update {
            self.handle_native_upgrade().await?;
        }

        if let Err(e) = self.try_apply_pending().await {
            warn!(error = %e, "Could not apply pending update at startup");
        }

        let enabled = self.config.read().await.periodic_check_enabled();
        if enabled {
            self.schedule_periodic().await;
        }
        Ok(())
    }

    /// Cancel timers. The host calls this on process exit.
    pub fn shutdown(&self) {
        if let Some(handle) = self.periodic.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.watchdog.lock().unwrap().take() {
            handle.abort();
        }
        info!("Updater shut down");
    }

    /// Subscribe to updater events.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<UpdaterEvent> {
        self.events.subscribe()
    }

    // --- update checking ---

    /// Raw answer of the update endpoint.
    pub async fn get_latest(&self) -> Result<LatestResponse> {
        let (url, info) = {
            let config = self.config.read().await;
            let info = api::device_info(&config, &self.store, self.crypto.key_id()).await;
            (config.update_url.clone(), info)
        };

        let response = self.client.post(&url).json(&info).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::HttpStatus {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(response.json().await?)
    }

    /// Ask the server for the latest bundle and, when there is one, download
    /// and stage (or directly apply) it.
    #[instrument(skip(self))]
    pub async fn check_for_updates(self: &Arc<Self>) -> Result<Option<BundleInfo>> {
        let latest = self.get_latest().await?;

        if latest.error.as_deref() == Some(NO_NEW_VERSION) {
            let current = self.registry.current().await;
            debug!(version = %current.version, "No new version available");
            self.events
                .emit(UpdaterEvent::NoNeedUpdate { bundle: current });
            return Ok(None);
        }
        if let Some(error) = latest.error {
            return Err(UpdateError::InvalidResponse(error));
        }

        let version = latest
            .version
            .ok_or_else(|| UpdateError::InvalidResponse("missing version".to_string()))?;
        self.events.emit(UpdaterEvent::UpdateAvailable {
            version: version.clone(),
        });

        if latest.breaking == Some(true) {
            info!(version = %version, "Breaking update available, skipping auto-download");
            self.events.emit(UpdaterEvent::BreakingAvailable {
                version: version.clone(),
            });
            self.events.emit(UpdaterEvent::MajorAvailable { version });
            return Ok(None);
        }

        let current = self.registry.current().await;
        if current.version == version {
            debug!(version = %version, "Already running the advertised version");
            self.events
                .emit(UpdaterEvent::NoNeedUpdate { bundle: current });
            return Ok(None);
        }

        let url = latest
            .url
            .ok_or_else(|| UpdateError::InvalidResponse("missing url".to_string()))?;
        let bundle = self
            .download_inner(DownloadRequest {
                url,
                version,
                checksum: latest.checksum,
                session_key: latest.session_key,
                manifest: latest.manifest,
                cache_tree: None,
            })
            .await?;

        let direct = self.config.read().await.direct_update;
        if direct.applies_immediately() {
            self.registry.set(&bundle.id).await?;
            self.reload().await?;
        } else {
            self.registry.next(&bundle.id).await?;
            self.try_apply_pending().await?;
        }
        Ok(Some(bundle))
    }

    /// Explicit download of a server-described bundle.
    pub async fn download(&self, request: DownloadRequest) -> Result<BundleInfo> {
        self.download_inner(request).await
    }

    async fn download_inner(&self, mut request: DownloadRequest) -> Result<BundleInfo> {
        // Manifest cache hits come from the tree the device currently runs.
        if !request.manifest.is_empty() && request.cache_tree.is_none() {
            let current = self.registry.current().await;
            request.cache_tree = if current.is_builtin() {
                self.config
                    .read()
                    .await
                    .builtin_path
                    .parent()
                    .map(|p| p.to_path_buf())
            } else {
                Some(self.registry.bundle_dir(&current.id).join("www"))
            };
        }

        let version = request.version.clone();
        let old_version = self.registry.current().await.version;

        let events = self.events.clone();
        let progress: Box<ProgressFn> =
            Box::new(move |percent| events.emit(UpdaterEvent::Download { percent }));

        match self.downloader.download_bundle(request, Some(&*progress)).await {
            Ok(bundle) => {
                self.events.emit(UpdaterEvent::DownloadComplete {
                    bundle: bundle.clone(),
                });
                self.spawn_stats(
                    StatsAction::DownloadComplete,
                    bundle.version.clone(),
                    old_version,
                    Some(bundle.id.clone()),
                    None,
                );
                Ok(bundle)
            }
            Err(e) => {
                self.events.emit(UpdaterEvent::DownloadFailed {
                    version: version.clone(),
                });
                self.spawn_stats(
                    StatsAction::DownloadFail,
                    version,
                    old_version,
                    None,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    // --- bundle operations ---

    pub async fn current(&self) -> BundleInfo {
        self.registry.current().await
    }

    pub async fn list(&self, include_builtin: bool) -> Vec<BundleInfo> {
        self.registry.list(include_builtin).await
    }

    pub async fn get_next_bundle(&self) -> Option<BundleInfo> {
        self.registry.get_next_bundle().await
    }

    /// Stage a bundle and try the gate right away.
    pub async fn next(self: &Arc<Self>, id: &str) -> Result<BundleInfo> {
        let staged = self.registry.next(id).await?;
        self.try_apply_pending().await?;
        Ok(staged)
    }

    /// Promote a bundle immediately and reload onto it.
    pub async fn set(self: &Arc<Self>, id: &str) -> Result<BundleInfo> {
        let bundle = self.registry.set(id).await?;
        self.reload().await?;
        Ok(bundle)
    }

    pub async fn delete_bundle(&self, id: &str) -> Result<()> {
        self.registry.delete_bundle(id).await
    }

    pub async fn set_bundle_error(&self, id: &str) -> Result<()> {
        self.registry.set_bundle_error(id).await
    }

    pub async fn reset(self: &Arc<Self>, to_builtin: bool) -> Result<BundleInfo> {
        let current = self.registry.reset(to_builtin).await?;
        self.reload().await?;
        Ok(current)
    }

    /// Point the host's main view at the current bundle. When the loaded
    /// bundle has not yet confirmed app-ready, the watchdog is armed.
    pub async fn reload(self: &Arc<Self>) -> Result<()> {
        let path = self.registry.current_bundle_path().await;
        info!(path = %path.display(), "Reloading main view");
        self.host.reload(&path);
        self.events.emit(UpdaterEvent::AppReloaded);

        let current = self.registry.current().await;
        if !current.is_builtin() && current.status == BundleStatus::Pending {
            self.arm_watchdog();
        }
        Ok(())
    }

    /// The host confirms the freshly loaded bundle booted successfully.
    #[instrument(skip(self))]
    pub async fn notify_app_ready(&self) -> Result<BundleInfo> {
        if let Some(handle) = self.watchdog.lock().unwrap().take() {
            handle.abort();
        }

        let old_version = {
            let store = self.store.read().await;
            store
                .fallback_bundle_id()
                .and_then(|id| store.get_bundle(id))
                .map(|b| b.version.clone())
        };
        let old_version =
            old_version.unwrap_or_else(|| self.registry.builtin_version().to_string());

        let bundle = self.registry.mark_bundle_successful().await?;
        info!(id = %bundle.id, version = %bundle.version, "App ready");
        self.events.emit(UpdaterEvent::AppReady {
            bundle: bundle.clone(),
        });

        if !bundle.is_builtin() {
            self.spawn_stats(
                StatsAction::Set,
                bundle.version.clone(),
                old_version,
                Some(bundle.id.clone()),
                None,
            );
        }
        Ok(bundle)
    }

    // --- delay gating ---

    pub async fn set_multi_delay(&self, conditions: Vec<DelayCondition>) -> Result<()> {
        self.delay.set_multi_delay(conditions).await
    }

    pub async fn cancel_delay(&self) -> Result<()> {
        self.delay.cancel_delay().await
    }

    /// The host window was blurred or hidden.
    pub async fn on_window_blur(self: &Arc<Self>) {
        self.delay.on_background();
        if let Err(e) = self.try_apply_pending().await {
            warn!(error = %e, "Gate attempt on blur failed");
        }
    }

    /// The host window regained focus.
    pub fn on_window_focus(&self) {
        self.delay.on_foreground();
    }

    /// Apply the staged bundle if one exists and the gate is open.
    async fn try_apply_pending(self: &Arc<Self>) -> Result<Option<BundleInfo>> {
        if self.registry.get_next_bundle().await.is_none() {
            return Ok(None);
        }
        if !self.delay.are_conditions_satisfied().await {
            debug!("Gate closed, pending update deferred");
            return Ok(None);
        }
        let applied = self.registry.apply_pending_update().await?;
        if let Some(bundle) = &applied {
            info!(id = %bundle.id, "Pending update applied");
            self.reload().await?;
        }
        Ok(applied)
    }

    // --- channels ---

    pub async fn set_channel(
        self: &Arc<Self>,
        channel: &str,
        trigger_auto_update: bool,
    ) -> Result<crate::api::ChannelResponse> {
        let response = self.channels.set_channel(channel).await?;
        if trigger_auto_update
            && matches!(response.status.as_deref(), Some("ok") | Some("success"))
        {
            if let Err(e) = self.check_for_updates().await {
                warn!(error = %e, "Update check after channel change failed");
            }
        }
        Ok(response)
    }

    pub async fn unset_channel(self: &Arc<Self>, trigger_auto_update: bool) -> Result<()> {
        self.channels.unset_channel().await?;
        if trigger_auto_update {
            if let Err(e) = self.check_for_updates().await {
                warn!(error = %e, "Update check after channel change failed");
            }
        }
        Ok(())
    }

    pub async fn get_channel(&self) -> crate::api::ChannelResponse {
        self.channels.get_channel().await
    }

    pub async fn list_channels(&self) -> Vec<crate::api::ChannelListEntry> {
        self.channels.list_channels().await
    }

    // --- identity and mutable configuration ---

    pub async fn get_device_id(&self) -> String {
        self.store.write().await.device_id()
    }

    pub async fn set_custom_id(&self, custom_id: Option<String>) -> Result<()> {
        let persist = self.config.read().await.persist_custom_id;
        let mut store = self.store.write().await;
        store.set_custom_id(custom_id);
        if persist {
            store.save().await?;
        }
        Ok(())
    }

    pub async fn set_update_url(&self, url: String) -> Result<()> {
        self.set_endpoint(EndpointKind::Update, url).await
    }

    pub async fn set_channel_url(&self, url: String) -> Result<()> {
        self.set_endpoint(EndpointKind::Channel, url).await
    }

    pub async fn set_stats_url(&self, url: String) -> Result<()> {
        self.set_endpoint(EndpointKind::Stats, url).await
    }

    pub async fn set_app_id(&self, app_id: String) -> Result<()> {
        {
            let mut config = self.config.write().await;
            if !config.allow_modify_app_id {
                return Err(UpdateError::NotAllowed(
                    "appId changes are disabled".to_string(),
                ));
            }
            config.app_id = app_id.clone();
        }
        self.persist_override(|store| store.set_app_id(Some(app_id)))
            .await
    }

    async fn set_endpoint(&self, kind: EndpointKind, url: String) -> Result<()> {
        {
            let mut config = self.config.write().await;
            if !config.allow_modify_url {
                return Err(UpdateError::NotAllowed(
                    "URL changes are disabled".to_string(),
                ));
            }
            match kind {
                EndpointKind::Update => config.update_url = url.clone(),
                EndpointKind::Channel => config.channel_url = url.clone(),
                EndpointKind::Stats => config.stats_url = url.clone(),
            }
        }
        self.persist_override(|store| match kind {
            EndpointKind::Update => store.set_update_url(Some(url)),
            EndpointKind::Channel => store.set_channel_url(Some(url)),
            EndpointKind::Stats => store.set_stats_url(Some(url)),
        })
        .await
    }

    async fn persist_override(&self, apply: impl FnOnce(&mut Store)) -> Result<()> {
        if !self.config.read().await.persist_modify_url {
            return Ok(());
        }
        let mut store = self.store.write().await;
        apply(&mut store);
        store.save().await
    }

    // --- internals ---

    /// A native upgrade invalidates every downloaded bundle: reset to the
    /// builtin and start over.
    async fn handle_native_upgrade(&self) -> Result<()> {
        let version_build = self.config.read().await.version_build.clone();
        let recorded = {
            let store = self.store.read().await;
            store.native_version().map(str::to_string)
        };

        match recorded {
            Some(previous) if previous != version_build => {
                info!(
                    from = %previous,
                    to = %version_build,
                    "Native version changed, resetting to builtin"
                );
                self.registry.purge_all_bundles().await?;
            }
            Some(_) => return Ok(()),
            None => {}
        }

        let mut store = self.store.write().await;
        store.set_native_version(Some(version_build));
        store.save().await
    }

    fn arm_watchdog(self: &Arc<Self>) {
        // app_ready_timeout_ms never changes after construction.
        let timeout = Duration::from_millis(
            self.config
                .try_read()
                .map(|c| c.app_ready_timeout_ms)
                .unwrap_or(10_000),
        );
        let updater = Arc::clone(self);

        let mut guard = self.watchdog.lock().unwrap();
        if let Some(previous) = guard.take() {
            previous.abort();
        }
        debug!(timeout_ms = timeout.as_millis() as u64, "App-ready watchdog armed");
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            updater.on_watchdog_fired().await;
        }));
    }

    async fn on_watchdog_fired(self: Arc<Self>) {
        let failed = self.registry.current().await;
        error!(
            id = %failed.id,
            version = %failed.version,
            "App-ready deadline missed, rolling back"
        );

        let restored = match self.registry.rollback().await {
            Ok(restored) => restored,
            Err(e) => {
                error!(error = %e, "Rollback failed");
                return;
            }
        };

        self.spawn_stats(
            StatsAction::SetFail,
            failed.version.clone(),
            restored.version.clone(),
            Some(failed.id.clone()),
            Some("app-ready deadline missed".to_string()),
        );
        self.events.emit(UpdaterEvent::UpdateFailed {
            bundle: BundleInfo {
                status: BundleStatus::Error,
                ..failed
            },
        });

        if let Err(e) = self.reload().await {
            error!(error = %e, "Reload after rollback failed");
        }
    }

    async fn schedule_periodic(self: &Arc<Self>) {
        let period = Duration::from_secs(self.config.read().await.period_check_delay_secs);
        let updater = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; the host controls the
            // initial check explicitly.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(updater) = updater.upgrade() else {
                    break;
                };
                debug!("Periodic update check");
                if let Err(e) = updater.check_for_updates().await {
                    warn!(error = %e, "Periodic update check failed");
                }
            }
        });

        let mut guard = self.periodic.lock().unwrap();
        if let Some(previous) = guard.take() {
            previous.abort();
        }
        *guard = Some(handle);
        info!(period_secs = period.as_secs(), "Periodic update check scheduled");
    }

    fn spawn_stats(
        &self,
        action: StatsAction,
        version: String,
        old_version: String,
        bundle_id: Option<String>,
        message: Option<String>,
    ) {
        let stats = self.stats.clone();
        tokio::spawn(async move {
            stats
                .send(
                    action,
                    &version,
                    &old_version,
                    bundle_id.as_deref(),
                    message.as_deref(),
                )
                .await;
        });
    }
}

#[derive(Clone, Copy)]
enum EndpointKind {
    Update,
    Channel,
    Stats,
}

impl Drop for Updater {
    fn drop(&mut self) {
        self.shutdown();
    }
}
