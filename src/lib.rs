//! # Electron Bundle Updater
//!
//! Over-the-air updates for the web asset bundle of a desktop application
//! host. The host ships a builtin bundle; at runtime the updater fetches
//! newer bundles from the update service, verifies and installs them
//! atomically, and hot-reloads the main view onto the new assets. A bundle
//! that fails to confirm itself alive within a deadline is rolled back to
//! the last known good one.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐      ┌──────────────────────────────┐
//! │ Update Service │      │ Host process                 │
//! │ (updates /     │◄─────┤   Updater (coordinator)      │
//! │  channel /     │      │   ├─ Downloader  ─ verify    │
//! │  stats)        │      │   ├─ Registry    ─ lifecycle │
//! └────────────────┘      │   ├─ Delay gate  ─ defer     │
//!         │               │   └─ Store       ─ persist   │
//!         │ bundle.zip    └──────────────────────────────┘
//!         ▼                        │
//! ┌────────────────┐               ▼
//! │ <userData>/    │      main view loads
//! │ capgo-bundles/ │────► <id>/www/index.html
//! └────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use electron_updater::{HostIntegration, Updater, UpdaterConfig};
//!
//! struct MyHost;
//! impl HostIntegration for MyHost {
//!     fn reload(&self, index_path: &std::path::Path) {
//!         // point the main window at index_path
//!     }
//! }
//!
//! # async fn run() -> electron_updater::Result<()> {
//! let config = UpdaterConfig {
//!     app_id: "com.demo.app".into(),
//!     user_data_dir: "/home/user/.config/demo".into(),
//!     builtin_path: "/opt/demo/resources/www/index.html".into(),
//!     ..Default::default()
//! };
//! let updater = Updater::new(config, Arc::new(MyHost)).await?;
//! updater.initialize().await?;
//! // after every reload of a promoted bundle:
//! updater.notify_app_ready().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod delay;
pub mod download;
pub mod error;
pub mod events;
pub mod host;
pub mod logging;
pub mod registry;
pub mod stats;
pub mod store;

pub use api::{ChannelListEntry, ChannelResponse, LatestResponse, ManifestEntry};
pub use config::{DirectUpdate, UpdaterConfig, MIN_PERIOD_CHECK_SECS};
pub use coordinator::Updater;
pub use delay::DelayCondition;
pub use download::DownloadRequest;
pub use error::{Result, UpdateError};
pub use events::UpdaterEvent;
pub use host::HostIntegration;
pub use logging::{init_logging, init_logging_json};
pub use stats::StatsAction;
pub use store::{BundleInfo, BundleStatus, BUILTIN_ID};
