//! Seam between the updater and the host process.
//!
//! Window management, main-view navigation and quit signals all live on the
//! host side; the updater only needs to point the main view at a bundle
//! path. Hosts call back into the coordinator for focus/blur and app-ready.

use std::path::Path;

/// Implemented by the embedding host process.
pub trait HostIntegration: Send + Sync {
    /// Point the main view at `index_path` and start loading it.
    fn reload(&self, index_path: &Path);
}
