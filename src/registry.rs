//! Bundle lifecycle registry.
//!
//! Tracks which bundle is current, which is staged as next, and which is
//! preserved as the rollback target. The builtin bundle shipped in the host
//! installer is never registered on disk: an absent `current` pointer means
//! the host runs the builtin assets.
//!
//! ```text
//!                   start download
//! downloading ──────────────────────► (verify + extract)
//!      │                               │
//!      │ any error                     │ ok
//!      ▼                               ▼
//!    error (cleaned up)             success ──► pending (via next)
//!                                    │           │
//!                                    │           ▼
//!                                    │        current (via apply/set)
//!                                    │           ├─ app-ready ──► confirmed
//!                                    │           └─ watchdog ───► rollback
//!                                    ▼
//!                                  deleted
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateError};
use crate::store::{BundleInfo, BundleStatus, Store, BUILTIN_ID, BUNDLES_DIR};

/// Owns bundle promotion, demotion and pruning.
pub struct BundleRegistry {
    store: Arc<RwLock<Store>>,
    bundles_dir: PathBuf,
    builtin_path: PathBuf,
    builtin_version: String,
    auto_delete_failed: bool,
    auto_delete_previous: bool,
    allow_manual_bundle_error: bool,
}

impl BundleRegistry {
    pub fn new(config: &UpdaterConfig, store: Arc<RwLock<Store>>) -> Self {
        Self {
            store,
            bundles_dir: config.user_data_dir.join(BUNDLES_DIR),
            builtin_path: config.builtin_path.clone(),
            builtin_version: config.builtin_version.clone(),
            auto_delete_failed: config.auto_delete_failed,
            auto_delete_previous: config.auto_delete_previous,
            allow_manual_bundle_error: config.allow_manual_bundle_error,
        }
    }

    /// Descriptor of the immutable builtin bundle.
    pub fn builtin_info(&self) -> BundleInfo {
        BundleInfo {
            id: BUILTIN_ID.to_string(),
            version: self.builtin_version.clone(),
            downloaded: DateTime::<Utc>::UNIX_EPOCH,
            checksum: String::new(),
            status: BundleStatus::Success,
        }
    }

    /// Version name the host installer ships with.
    pub fn builtin_version(&self) -> &str {
        &self.builtin_version
    }

    /// The bundle `reload()` would load next.
    pub async fn current(&self) -> BundleInfo {
        let store = self.store.read().await;
        store
            .current_bundle_id()
            .filter(|id| *id != BUILTIN_ID)
            .and_then(|id| store.get_bundle(id).cloned())
            .unwrap_or_else(|| self.builtin_info())
    }

    /// All known bundles, the builtin descriptor included unless filtered.
    pub async fn list(&self, include_builtin: bool) -> Vec<BundleInfo> {
        let mut bundles = self.store.read().await.list_bundles();
        if include_builtin {
            bundles.insert(0, self.builtin_info());
        }
        bundles
    }

    pub async fn get_bundle(&self, id: &str) -> Option<BundleInfo> {
        if id == BUILTIN_ID {
            return Some(self.builtin_info());
        }
        self.store.read().await.get_bundle(id).cloned()
    }

    /// The staged successor, if any.
    pub async fn get_next_bundle(&self) -> Option<BundleInfo> {
        let store = self.store.read().await;
        store
            .next_bundle_id()
            .and_then(|id| store.get_bundle(id).cloned())
    }

    /// Stage a downloaded bundle to become current once the gate opens.
    #[instrument(skip(self))]
    pub async fn next(&self, id: &str) -> Result<BundleInfo> {
        let mut store = self.store.write().await;
        let bundle = store
            .get_bundle(id)
            .cloned()
            .ok_or_else(|| UpdateError::NotFound(id.to_string()))?;
        if bundle.status != BundleStatus::Success {
            return Err(UpdateError::NotAllowed(format!(
                "bundle {id} is {} and cannot be staged",
                bundle.status
            )));
        }

        store.set_bundle_status(id, BundleStatus::Pending);
        store.set_next_bundle_id(Some(id.to_string()));
        store.save().await?;
        info!(id = %id, version = %bundle.version, "Bundle staged as next");
        Ok(BundleInfo {
            status: BundleStatus::Pending,
            ..bundle
        })
    }

    /// Promote a bundle to current, demoting the previous current to the
    /// rollback slot. The promoted bundle stays `pending` until the host
    /// confirms app-ready.
    #[instrument(skip(self))]
    pub async fn set(&self, id: &str) -> Result<BundleInfo> {
        let mut store = self.store.write().await;

        let promoted = if id == BUILTIN_ID {
            self.builtin_info()
        } else {
            let bundle = store
                .get_bundle(id)
                .cloned()
                .ok_or_else(|| UpdateError::NotFound(id.to_string()))?;
            if !matches!(bundle.status, BundleStatus::Success | BundleStatus::Pending) {
                return Err(UpdateError::NotAllowed(format!(
                    "bundle {id} is {} and cannot become current",
                    bundle.status
                )));
            }
            bundle
        };

        let previous = store
            .current_bundle_id()
            .filter(|prev| *prev != id && *prev != BUILTIN_ID)
            .map(str::to_string);

        if id == BUILTIN_ID {
            store.set_current_bundle_id(None);
        } else {
            store.set_bundle_status(id, BundleStatus::Pending);
            store.set_current_bundle_id(Some(id.to_string()));
        }
        store.set_fallback_bundle_id(previous.clone());
        store.save().await?;

        info!(id = %id, fallback = ?previous, "Bundle promoted to current");
        Ok(promoted)
    }

    /// Promote the staged bundle and clear the `next` pointer. Returns
    /// `None` when nothing is staged. Gate evaluation is the caller's job.
    pub async fn apply_pending_update(&self) -> Result<Option<BundleInfo>> {
        let next_id = {
            let store = self.store.read().await;
            store.next_bundle_id().map(str::to_string)
        };
        let Some(next_id) = next_id else {
            return Ok(None);
        };

        let bundle = self.set(&next_id).await?;
        let mut store = self.store.write().await;
        store.set_next_bundle_id(None);
        store.save().await?;
        Ok(Some(bundle))
    }

    /// Confirm the current bundle after app-ready: it becomes `success`, and
    /// the demoted fallback is pruned when configured.
    #[instrument(skip(self))]
    pub async fn mark_bundle_successful(&self) -> Result<BundleInfo> {
        let (current_id, fallback_id) = {
            let store = self.store.read().await;
            (
                store.current_bundle_id().map(str::to_string),
                store.fallback_bundle_id().map(str::to_string),
            )
        };

        {
            let mut store = self.store.write().await;
            if let Some(id) = current_id.as_deref().filter(|id| *id != BUILTIN_ID) {
                store.set_bundle_status(id, BundleStatus::Success);
            }
            store.set_fallback_bundle_id(None);
            store.save().await?;
        }

        if let Some(fallback) = fallback_id.filter(|id| id != BUILTIN_ID) {
            if self.auto_delete_previous && Some(&fallback) != current_id.as_ref() {
                info!(id = %fallback, "Pruning previous bundle");
                self.remove_bundle(&fallback).await?;
            }
        }

        Ok(self.current().await)
    }

    /// Roll back after a failed reload: the current bundle is marked
    /// `error` and cleaned up, and the fallback (or builtin) takes over.
    #[instrument(skip(self))]
    pub async fn rollback(&self) -> Result<BundleInfo> {
        let (failed_id, restored) = {
            let store = self.store.read().await;
            let failed_id = store.current_bundle_id().map(str::to_string);
            // Only a confirmed bundle is a valid rollback target.
            let restored = store
                .fallback_bundle_id()
                .filter(|id| *id != BUILTIN_ID)
                .and_then(|id| store.get_bundle(id))
                .filter(|b| b.status == BundleStatus::Success)
                .cloned();
            (failed_id, restored)
        };

        {
            let mut store = self.store.write().await;
            store.set_current_bundle_id(restored.as_ref().map(|b| b.id.clone()));
            store.set_fallback_bundle_id(None);
            if let Some(failed) = failed_id.as_deref().filter(|id| *id != BUILTIN_ID) {
                if self.auto_delete_failed {
                    store.remove_bundle(failed);
                } else {
                    store.set_bundle_status(failed, BundleStatus::Error);
                }
            }
            store.save().await?;
        }

        if let Some(failed) = failed_id.as_deref().filter(|id| *id != BUILTIN_ID) {
            warn!(id = %failed, "Removing files of failed bundle");
            self.remove_bundle_files(failed).await;
        }

        let restored = restored.unwrap_or_else(|| self.builtin_info());
        info!(restored = %restored.id, "Rolled back");
        Ok(restored)
    }

    /// Delete a bundle that is neither current, staged, nor builtin.
    #[instrument(skip(self))]
    pub async fn delete_bundle(&self, id: &str) -> Result<()> {
        if id == BUILTIN_ID {
            return Err(UpdateError::NotAllowed(
                "the builtin bundle cannot be deleted".to_string(),
            ));
        }
        {
            let store = self.store.read().await;
            if store.get_bundle(id).is_none() {
                return Err(UpdateError::NotFound(id.to_string()));
            }
            if store.current_bundle_id() == Some(id) {
                return Err(UpdateError::NotAllowed(format!("bundle {id} is current")));
            }
            if store.next_bundle_id() == Some(id) {
                return Err(UpdateError::NotAllowed(format!("bundle {id} is staged")));
            }
        }
        self.remove_bundle(id).await
    }

    /// Manually flag a bundle as broken. Guarded by configuration.
    #[instrument(skip(self))]
    pub async fn set_bundle_error(&self, id: &str) -> Result<()> {
        if !self.allow_manual_bundle_error {
            return Err(UpdateError::NotAllowed(
                "manual bundle error is disabled".to_string(),
            ));
        }
        if id == BUILTIN_ID {
            return Err(UpdateError::NotAllowed(
                "the builtin bundle cannot be flagged".to_string(),
            ));
        }

        let mut store = self.store.write().await;
        if store.get_bundle(id).is_none() {
            return Err(UpdateError::NotFound(id.to_string()));
        }
        if store.current_bundle_id() == Some(id) {
            return Err(UpdateError::NotAllowed(format!("bundle {id} is current")));
        }
        if store.next_bundle_id() == Some(id) {
            store.set_next_bundle_id(None);
        }
        if self.auto_delete_failed {
            store.remove_bundle(id);
        } else {
            store.set_bundle_status(id, BundleStatus::Error);
        }
        store.save().await?;
        drop(store);

        self.remove_bundle_files(id).await;
        Ok(())
    }

    /// Reset the current pointer: to the builtin, or to the most recently
    /// installed confirmed bundle. Clears the staged successor.
    #[instrument(skip(self))]
    pub async fn reset(&self, to_builtin: bool) -> Result<BundleInfo> {
        let mut store = self.store.write().await;
        store.set_next_bundle_id(None);

        if to_builtin {
            store.set_current_bundle_id(None);
        } else {
            let latest = store
                .list_bundles()
                .into_iter()
                .filter(|b| b.status == BundleStatus::Success)
                .next_back();
            store.set_current_bundle_id(latest.map(|b| b.id));
        }
        store.set_fallback_bundle_id(None);
        store.save().await?;
        drop(store);

        Ok(self.current().await)
    }

    /// Remove every downloaded bundle and all pointers. Used when a native
    /// upgrade invalidates the installed web assets.
    pub async fn purge_all_bundles(&self) -> Result<()> {
        let ids: Vec<String> = {
            let mut store = self.store.write().await;
            let ids: Vec<String> = store.list_bundles().into_iter().map(|b| b.id).collect();
            store.set_current_bundle_id(None);
            store.set_next_bundle_id(None);
            store.set_fallback_bundle_id(None);
            for id in ids.iter() {
                store.remove_bundle(id.as_str());
            }
            store.save().await?;
            ids
        };
        for id in ids {
            self.remove_bundle_files(&id).await;
        }
        Ok(())
    }

    /// Path `reload()` should load: the bundle's `www/index.html`, or the
    /// externally supplied builtin path.
    pub async fn current_bundle_path(&self) -> PathBuf {
        let current = self.current().await;
        if current.is_builtin() {
            self.builtin_path.clone()
        } else {
            self.bundle_dir(&current.id).join("www").join("index.html")
        }
    }

    pub fn bundle_dir(&self, id: &str) -> PathBuf {
        self.bundles_dir.join(id)
    }

    async fn remove_bundle(&self, id: &str) -> Result<()> {
        {
            let mut store = self.store.write().await;
            store.remove_bundle(id);
            store.save().await?;
        }
        self.remove_bundle_files(id).await;
        Ok(())
    }

    async fn remove_bundle_files(&self, id: &str) {
        let dir = self.bundle_dir(id);
        if let Err(e) = fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(id = %id, error = %e, "Failed to remove bundle directory");
            }
        }
    }
}
