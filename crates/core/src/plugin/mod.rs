// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The platform-plugin contracts.
//!
//! Each platform plugin is a black box behind one of these capability traits;
//! the DOM knowledge lives entirely on the plugin side. The registry keys
//! plugins by `(kind, platform)` and the capability set is determined by the
//! kind alone. [`scripted`] holds the uniform, configuration-driven plugin
//! family the server registers at startup.

pub mod scripted;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tabfleet_data_model::{
    AccountInfo, MonitorDenyReason, Platform, PluginDescriptor, SendReport, SyncedThread, TabId,
    UploadOutcome, UploadRequest,
};
use url::Url;

use crate::error::CoreError;

/// What `start_login` hands back synchronously.
#[derive(Debug, Clone)]
pub struct LoginStart {
    /// The tab showing the QR code.
    pub tab_id: Option<TabId>,
    /// The QR code image URL to present to the user.
    pub qr_code_url: Option<String>,
}

/// What the login processor reports once the QR scan completed.
#[derive(Debug, Clone)]
pub struct LoginCompletion {
    /// The captured cookie bundle.
    pub cookie_file: Utf8PathBuf,
    /// Profile details of the freshly logged-in account.
    pub account_info: Option<AccountInfo>,
}

/// Parameters of one message sync against an already-ensured tab.
#[derive(Debug, Clone)]
pub struct SyncParams {
    /// Platform of the synced account.
    pub platform: Platform,
    /// The synced account.
    pub account_id: String,
    /// The custodian's message tab for the account.
    pub tab_id: TabId,
    /// Whether to pull full history instead of the recent window.
    pub full_sync: bool,
}

/// What a message plugin pulled from the inbox.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    /// Whether the pull completed.
    pub success: bool,
    /// Threads visible in the inbox.
    pub threads: Vec<SyncedThread>,
    /// Non-fatal errors encountered while pulling.
    pub errors: Vec<String>,
    /// When the pull ran.
    pub sync_time: DateTime<Utc>,
}

/// Parameters for sending one direct message.
#[derive(Debug, Clone)]
pub struct SendParams {
    /// The tab to drive.
    pub tab_id: TabId,
    /// Display name of the recipient.
    pub user_name: String,
    /// `text` content, or the image path/URL for `image` messages.
    pub content: String,
    /// Message kind tag, `text` or `image`.
    pub kind: tabfleet_data_model::MessageKind,
}

/// Parameters for installing an inbox listener.
#[derive(Debug, Clone)]
pub struct StartMonitoringParams {
    /// Platform of the monitored account.
    pub platform: Platform,
    /// The monitored account.
    pub account_id: String,
    /// The account's cookie bundle.
    pub cookie_file: Utf8PathBuf,
    /// The custodian's message tab for the account.
    pub tab_id: TabId,
    /// Whether the tab runs without a visible window.
    pub headless: bool,
}

/// Outcome of installing an inbox listener.
#[derive(Debug, Clone)]
pub struct MonitorStart {
    /// Whether the listener is installed and streaming.
    pub started: bool,
    /// Why the start was denied, when it was.
    pub deny: Option<MonitorDenyReason>,
}

impl MonitorStart {
    /// A successful start.
    #[must_use]
    pub fn started() -> Self {
        Self {
            started: true,
            deny: None,
        }
    }

    /// A denied start.
    #[must_use]
    pub fn denied(reason: MonitorDenyReason) -> Self {
        Self {
            started: false,
            deny: Some(reason),
        }
    }
}

/// Drives an end-to-end video upload on one platform.
#[async_trait]
pub trait UploadPlugin: Send + Sync {
    /// Identity of the plugin.
    fn descriptor(&self) -> PluginDescriptor;

    /// Runs the whole upload flow: open a tab, stream the file, fill the
    /// form, trigger the publish. The returned tab stays open so the caller
    /// can await the publish redirect; the caller owns closing it.
    async fn upload_video_complete(
        &self,
        request: &UploadRequest,
    ) -> Result<UploadOutcome, CoreError>;

    /// Reads the logged-in account's profile from an open tab.
    async fn account_info(&self, tab: &TabId) -> Result<AccountInfo, CoreError>;
}

/// Starts and cancels QR logins.
#[async_trait]
pub trait LoginPlugin: Send + Sync {
    /// Identity of the plugin.
    fn descriptor(&self) -> PluginDescriptor;

    /// Opens the platform's login page and extracts the QR code.
    async fn start_login(&self, user_id: &str) -> Result<LoginStart, CoreError>;

    /// Tears down a pending login's tab-side state.
    async fn cancel_login(&self, tab: &TabId) -> Result<(), CoreError>;
}

/// Blocks until a pending QR login completes, fails or times out.
#[async_trait]
pub trait LoginProcessor: Send + Sync {
    /// Identity of the plugin.
    fn descriptor(&self) -> PluginDescriptor;

    /// Watches the login tab until the user scans the QR code, then captures
    /// the session as a cookie bundle.
    async fn process(
        &self,
        tab: &TabId,
        platform: &Platform,
        user_id: &str,
    ) -> Result<LoginCompletion, CoreError>;
}

/// Checks whether a stored cookie bundle is still accepted.
#[async_trait]
pub trait ValidatePlugin: Send + Sync {
    /// Identity of the plugin.
    fn descriptor(&self) -> PluginDescriptor;

    /// `true` when the platform still accepts the bundle.
    async fn validate_cookie(&self, cookie_file: &Utf8Path) -> Result<bool, CoreError>;
}

/// Syncs and sends direct messages, and installs inbox listeners.
#[async_trait]
pub trait MessagePlugin: Send + Sync {
    /// Identity of the plugin.
    fn descriptor(&self) -> PluginDescriptor;

    /// The platform's message inbox URL.
    fn message_url(&self) -> Url;

    /// A DOM predicate script deciding whether a freshly navigated message
    /// tab is ready (message list present, login form absent). `None` means
    /// the tab is considered ready as soon as it exists.
    fn readiness_script(&self) -> Option<String> {
        None
    }

    /// Pulls threads and messages from the inbox tab.
    async fn sync_messages(&self, params: &SyncParams) -> Result<SyncBatch, CoreError>;

    /// Sends one direct message through the tab.
    async fn send_message(&self, params: &SendParams) -> Result<SendReport, CoreError>;

    /// Installs the event-driven inbox listener into the tab.
    async fn start_monitoring(
        &self,
        params: &StartMonitoringParams,
    ) -> Result<MonitorStart, CoreError>;
}
