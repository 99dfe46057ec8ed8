//! Updater configuration.
//!
//! The host process constructs an [`UpdaterConfig`] programmatically or
//! deserializes it from its own settings file. Every field has a default so
//! a minimal host only needs to supply `user_data_dir` and `builtin_path`.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

/// Minimum effective period for the background update check. Lower values
/// disable scheduling entirely.
pub const MIN_PERIOD_CHECK_SECS: u64 = 600;

/// How a freshly downloaded bundle is promoted.
///
/// `AtInstall` and `OnLaunch` are accepted from configuration but currently
/// behave like `Disabled`: distinguishing the first launch after a native
/// install would require tracking install generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DirectUpdate {
    Disabled,
    Always,
    AtInstall,
    OnLaunch,
}

impl Default for DirectUpdate {
    fn default() -> Self {
        Self::Disabled
    }
}

impl DirectUpdate {
    /// Whether a downloaded bundle becomes current immediately instead of
    /// being staged behind the gate.
    pub fn applies_immediately(&self) -> bool {
        matches!(self, DirectUpdate::Always)
    }
}

// Accepts `false`, `true`, `"always"`, `"atInstall"`, `"onLaunch"`.
impl<'de> Deserialize<'de> for DirectUpdate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Mode(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => Ok(DirectUpdate::Disabled),
            Raw::Flag(true) => Ok(DirectUpdate::Always),
            Raw::Mode(s) => match s.as_str() {
                "always" => Ok(DirectUpdate::Always),
                "atInstall" => Ok(DirectUpdate::AtInstall),
                "onLaunch" => Ok(DirectUpdate::OnLaunch),
                other => Err(serde::de::Error::custom(format!(
                    "invalid directUpdate mode '{other}'"
                ))),
            },
        }
    }
}

/// Updater configuration supplied by the host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdaterConfig {
    /// Application identifier sent to the update service.
    #[serde(default)]
    pub app_id: String,

    /// Native build version of the host application.
    #[serde(default = "default_version_build")]
    pub version_build: String,

    /// Native build number.
    #[serde(default = "default_version_code")]
    pub version_code: String,

    /// Operating system release string.
    #[serde(default = "default_version_os")]
    pub version_os: String,

    /// Endpoint answering `getLatest` requests.
    #[serde(default = "default_update_url")]
    pub update_url: String,

    /// Endpoint for channel selection.
    #[serde(default = "default_channel_url")]
    pub channel_url: String,

    /// Endpoint for telemetry. Empty disables telemetry entirely.
    #[serde(default = "default_stats_url")]
    pub stats_url: String,

    /// Channel requested when the device has none persisted.
    #[serde(default)]
    pub default_channel: Option<String>,

    /// Milliseconds the app-ready watchdog waits before rolling back.
    #[serde(default = "default_app_ready_timeout")]
    pub app_ready_timeout_ms: u64,

    /// Seconds before any HTTP request is aborted.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    /// Enable periodic background checks.
    #[serde(default = "default_true")]
    pub auto_update: bool,

    /// Remove files and registry records of failed bundles.
    #[serde(default = "default_true")]
    pub auto_delete_failed: bool,

    /// Prune the demoted (fallback) bundle once its successor confirms.
    #[serde(default = "default_true")]
    pub auto_delete_previous: bool,

    /// Reset to the builtin bundle when the native version changes.
    #[serde(default = "default_true")]
    pub reset_when_update: bool,

    /// PEM-encoded RSA public key used to unwrap per-download session keys.
    #[serde(default)]
    pub public_key: Option<String>,

    /// Permit `set_bundle_error` from the host.
    #[serde(default)]
    pub allow_manual_bundle_error: bool,

    /// Persist a host-supplied custom device id across restarts.
    #[serde(default)]
    pub persist_custom_id: bool,

    /// Persist runtime URL / app-id overrides across restarts.
    #[serde(default)]
    pub persist_modify_url: bool,

    /// Permit runtime changes to the three service URLs.
    #[serde(default)]
    pub allow_modify_url: bool,

    /// Permit runtime changes to the app id.
    #[serde(default)]
    pub allow_modify_app_id: bool,

    /// Seconds between periodic checks. Values below
    /// [`MIN_PERIOD_CHECK_SECS`] disable the schedule.
    #[serde(default = "default_period_check_delay")]
    pub period_check_delay_secs: u64,

    /// Promotion mode for downloaded bundles.
    #[serde(default)]
    pub direct_update: DirectUpdate,

    /// Reported to the server as `is_prod`.
    #[serde(default = "default_true")]
    pub is_prod: bool,

    /// Directory owning the bundles tree and the storage file.
    #[serde(default)]
    pub user_data_dir: PathBuf,

    /// Path to the builtin bundle's `index.html`, shipped in the installer.
    #[serde(default)]
    pub builtin_path: PathBuf,

    /// Version name of the builtin bundle.
    #[serde(default = "default_builtin_version")]
    pub builtin_version: String,
}

fn default_version_build() -> String {
    "0.0.0".to_string()
}

fn default_version_code() -> String {
    "0".to_string()
}

fn default_version_os() -> String {
    std::env::consts::OS.to_string()
}

fn default_update_url() -> String {
    "https://plugin.capgo.app/updates".to_string()
}

fn default_channel_url() -> String {
    "https://plugin.capgo.app/channel_self".to_string()
}

fn default_stats_url() -> String {
    "https://plugin.capgo.app/stats".to_string()
}

fn default_app_ready_timeout() -> u64 {
    10_000
}

fn default_response_timeout() -> u64 {
    20
}

fn default_period_check_delay() -> u64 {
    MIN_PERIOD_CHECK_SECS
}

fn default_builtin_version() -> String {
    "builtin".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            version_build: default_version_build(),
            version_code: default_version_code(),
            version_os: default_version_os(),
            update_url: default_update_url(),
            channel_url: default_channel_url(),
            stats_url: default_stats_url(),
            default_channel: None,
            app_ready_timeout_ms: default_app_ready_timeout(),
            response_timeout_secs: default_response_timeout(),
            auto_update: true,
            auto_delete_failed: true,
            auto_delete_previous: true,
            reset_when_update: true,
            public_key: None,
            allow_manual_bundle_error: false,
            persist_custom_id: false,
            persist_modify_url: false,
            allow_modify_url: false,
            allow_modify_app_id: false,
            period_check_delay_secs: default_period_check_delay(),
            direct_update: DirectUpdate::Disabled,
            is_prod: true,
            user_data_dir: PathBuf::new(),
            builtin_path: PathBuf::new(),
            builtin_version: default_builtin_version(),
        }
    }
}

impl UpdaterConfig {
    /// Validate configuration before the updater starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.user_data_dir.as_os_str().is_empty() {
            return Err("userDataDir must be set".to_string());
        }
        if self.response_timeout_secs == 0 {
            return Err("responseTimeout must be at least 1 second".to_string());
        }
        if self.update_url.is_empty() {
            return Err("updateUrl cannot be empty".to_string());
        }
        Ok(())
    }

    /// Whether the periodic check should be scheduled at all.
    pub fn periodic_check_enabled(&self) -> bool {
        self.auto_update && self.period_check_delay_secs >= MIN_PERIOD_CHECK_SECS
    }
}
