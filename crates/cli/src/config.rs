// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! Configuration of the `tabfleet` binary.
//!
//! Layered with figment: the YAML file first, then `TABFLEET_`-prefixed
//! environment variables (`__` as the section separator).

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tabfleet_core::{monitor::MonitoringConfig, scheduler::SchedulerConfig};
use url::Url;

/// Builds the layered configuration source.
#[must_use]
pub fn figment(config_file: &Utf8Path) -> Figment {
    Figment::new()
        .merge(Yaml::file(config_file.as_std_path()))
        .merge(Env::prefixed("TABFLEET_").split("__"))
}

fn default_listen() -> String {
    "127.0.0.1:3409".to_owned()
}

/// The HTTP server section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// The address the JSON API binds to.
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_bridge_url() -> Url {
    Url::parse("http://127.0.0.1:9528/api/").expect("static url")
}

/// The browser-bridge section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Base URL of the external browser bridge.
    #[serde(default = "default_bridge_url")]
    pub base_url: Url,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: default_bridge_url(),
        }
    }
}

/// Filesystem roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Where cookie bundles live.
    pub cookie_dir: Utf8PathBuf,
    /// Where uploadable videos live.
    pub video_dir: Utf8PathBuf,
    /// Where account avatars live.
    pub avatar_dir: Utf8PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cookie_dir: Utf8PathBuf::from("./data/cookies"),
            video_dir: Utf8PathBuf::from("./data/videos"),
            avatar_dir: Utf8PathBuf::from("./data/avatars"),
        }
    }
}

/// The scheduler section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Syncs allowed in flight at once.
    pub max_concurrent_tasks: Option<usize>,
    /// Interval assigned to tasks registered without one.
    pub default_interval_minutes: Option<u32>,
    /// Base of the per-error exponential backoff.
    pub backoff_multiplier: Option<f64>,
}

impl SchedulerSection {
    /// Applies the section over the built-in defaults.
    #[must_use]
    pub fn to_config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        if let Some(max) = self.max_concurrent_tasks {
            config.max_concurrent_tasks = max;
        }
        if let Some(interval) = self.default_interval_minutes {
            config.default_interval_minutes = interval;
        }
        if let Some(backoff) = self.backoff_multiplier {
            config.backoff_multiplier = backoff;
        }
        config
    }
}

/// The monitoring section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    /// Accounts synced at once during the sync phase.
    pub sync_concurrency: Option<usize>,
    /// Per-account budget of the sync phase, in seconds.
    pub sync_timeout_secs: Option<u64>,
}

impl MonitoringSection {
    /// Applies the section over the built-in defaults.
    #[must_use]
    pub fn to_config(&self) -> MonitoringConfig {
        let mut config = MonitoringConfig::default();
        if let Some(concurrency) = self.sync_concurrency {
            config.sync_concurrency = concurrency;
        }
        if let Some(timeout) = self.sync_timeout_secs {
            config.sync_timeout = Duration::from_secs(timeout);
        }
        config
    }
}

/// Script sources of one platform pack, as paths on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptFilesConfig {
    /// DOM predicate: message tab is ready.
    pub readiness: Option<Utf8PathBuf>,
    /// Pulls the inbox.
    pub sync: Utf8PathBuf,
    /// Sends one DM.
    pub send: Utf8PathBuf,
    /// Installs the inbox listener.
    pub monitor: Utf8PathBuf,
    /// Session probe.
    pub validate: Utf8PathBuf,
    /// Extracts the QR code.
    pub login_start: Utf8PathBuf,
    /// Polls the login state.
    pub login_poll: Utf8PathBuf,
    /// Tears down a pending login.
    pub login_cancel: Option<Utf8PathBuf>,
    /// Fills the upload form and publishes.
    pub upload_publish: Utf8PathBuf,
    /// Reads the logged-in profile.
    pub account_info: Utf8PathBuf,
}

fn default_file_input_selector() -> String {
    "input[type=file]".to_owned()
}

/// One platform's entry URLs and script pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// The platform tag plugins register under.
    pub platform: String,
    /// Human-readable plugin name; the tag when absent.
    pub display_name: Option<String>,
    /// The message inbox.
    pub message_url: Url,
    /// The QR login page.
    pub login_url: Url,
    /// The creator-studio upload page.
    pub upload_url: Url,
    /// A lightweight page for session probes; the inbox when absent.
    pub probe_url: Option<Url>,
    /// CSS selector of the upload page's file input.
    #[serde(default = "default_file_input_selector")]
    pub file_input_selector: String,
    /// The platform's opaque page scripts.
    pub scripts: ScriptFilesConfig,
}

/// The whole configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP server settings.
    pub http: HttpConfig,
    /// Browser bridge settings.
    pub bridge: BridgeConfig,
    /// Filesystem roots.
    pub paths: PathsConfig,
    /// Scheduler tunables.
    pub scheduler: SchedulerSection,
    /// Monitoring tunables.
    pub monitoring: MonitoringSection,
    /// Platform script packs to register at startup.
    pub platforms: Vec<PlatformConfig>,
}

impl AppConfig {
    /// Extracts the configuration from the layered sources.
    pub fn extract(figment: &Figment) -> Result<Self, figment::Error> {
        figment.extract()
    }
}
