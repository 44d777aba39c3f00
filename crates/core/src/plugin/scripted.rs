// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! Configuration-driven plugins.
//!
//! A script pack bundles one platform's opaque page scripts with the URLs
//! they run against. The plugins here are entirely platform-agnostic: they
//! open tabs through the broker, inject the configured scripts and decode
//! the JSON the scripts resolve with. What the scripts do inside the page is
//! the platform's business.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tabfleet_data_model::{
    AccountInfo, MonitorDenyReason, Platform, PluginDescriptor, PluginKind, SendReport, SyncedThread,
    TabId, UploadOutcome, UploadRequest,
};
use tabfleet_storage::{BoxClock, Clock as _};
use url::Url;

use super::{
    LoginCompletion, LoginPlugin, LoginProcessor, LoginStart, MessagePlugin, MonitorStart,
    SendParams, StartMonitoringParams, SyncBatch, SyncParams, UploadPlugin, ValidatePlugin,
};
use crate::{
    broker::{CreateTabParams, TabBroker},
    error::{CoreError, TimeoutPhase},
};

/// Budget for quick DOM scripts (predicates, form pokes).
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(3);
/// Budget for one inbox pull.
const SYNC_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for the in-page upload form flow.
const UPLOAD_SCRIPT_TIMEOUT: Duration = Duration::from_secs(120);
/// How long a login processor waits for the QR scan.
const LOGIN_PROCESS_TIMEOUT: Duration = Duration::from_secs(300);
/// Interval between login poll scripts.
const LOGIN_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The opaque page scripts of one platform.
#[derive(Debug, Clone, Default)]
pub struct Scripts {
    /// DOM predicate: message tab is ready.
    pub readiness: Option<String>,
    /// Pulls the inbox; resolves `{success, threads, errors}`.
    pub sync: String,
    /// Sends one DM; resolves `{success, messageId?, error?}`.
    pub send: String,
    /// Installs the inbox listener; resolves `{success, reason?}`.
    pub monitor: String,
    /// Session probe; resolves a boolean or `{valid}`.
    pub validate: String,
    /// Extracts the QR code; resolves `{qrCodeUrl}`.
    pub login_start: String,
    /// Polls the login state; resolves `{status, accountInfo?}`.
    pub login_poll: String,
    /// Tears down a pending login, when the platform needs it.
    pub login_cancel: Option<String>,
    /// Fills the upload form and publishes; resolves `{success, error?}`.
    pub upload_publish: String,
    /// Reads the logged-in profile; resolves an account-info object.
    pub account_info: String,
}

/// One platform's scripts and entry URLs.
#[derive(Debug, Clone)]
pub struct ScriptPack {
    /// The platform tag the pack registers under.
    pub platform: Platform,
    /// Human-readable plugin name.
    pub display_name: String,
    /// The message inbox.
    pub message_url: Url,
    /// The QR login page.
    pub login_url: Url,
    /// The creator-studio upload page.
    pub upload_url: Url,
    /// A lightweight page for session probes.
    pub probe_url: Url,
    /// CSS selector of the upload page's file input.
    pub file_input_selector: String,
    /// The scripts themselves.
    pub scripts: Scripts,
}

/// Wraps a script source into an invocation with a JSON argument object.
fn invoke<P: Serialize>(script: &str, params: &P) -> Result<String, CoreError> {
    let params = serde_json::to_string(params).map_err(|e| anyhow::Error::new(e))?;
    Ok(format!("({script})({params})"))
}

fn decode<T: for<'de> Deserialize<'de>>(value: serde_json::Value) -> Result<T, CoreError> {
    serde_json::from_value(value)
        .map_err(|e| CoreError::Transient(anyhow::anyhow!("malformed script reply: {e}")))
}

/// The message-capability plugin over a script pack.
pub struct ScriptedMessagePlugin {
    broker: Arc<dyn TabBroker>,
    pack: Arc<ScriptPack>,
    clock: BoxClock,
}

impl ScriptedMessagePlugin {
    /// Creates the plugin.
    pub fn new(broker: Arc<dyn TabBroker>, pack: Arc<ScriptPack>, clock: BoxClock) -> Self {
        Self {
            broker,
            pack,
            clock,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncReply {
    success: bool,
    #[serde(default)]
    threads: Vec<SyncedThread>,
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendReply {
    success: bool,
    message_id: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitorReply {
    success: bool,
    reason: Option<String>,
}

#[async_trait]
impl MessagePlugin for ScriptedMessagePlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(
            PluginKind::Message,
            self.pack.platform.clone(),
            self.pack.display_name.clone(),
        )
    }

    fn message_url(&self) -> Url {
        self.pack.message_url.clone()
    }

    fn readiness_script(&self) -> Option<String> {
        self.pack.scripts.readiness.clone()
    }

    #[tracing::instrument(
        name = "plugin.scripted.sync_messages",
        skip_all,
        fields(platform = %params.platform, account_id = params.account_id),
    )]
    async fn sync_messages(&self, params: &SyncParams) -> Result<SyncBatch, CoreError> {
        let script = invoke(
            &self.pack.scripts.sync,
            &serde_json::json!({
                "accountId": params.account_id,
                "fullSync": params.full_sync,
            }),
        )?;
        let value = self
            .broker
            .execute_script(&params.tab_id, &script, SYNC_SCRIPT_TIMEOUT)
            .await?;
        let reply: SyncReply = decode(value)?;
        Ok(SyncBatch {
            success: reply.success,
            threads: reply.threads,
            errors: reply.errors,
            sync_time: self.clock.now(),
        })
    }

    #[tracing::instrument(
        name = "plugin.scripted.send_message",
        skip_all,
        fields(user_name = params.user_name),
    )]
    async fn send_message(&self, params: &SendParams) -> Result<SendReport, CoreError> {
        let script = invoke(
            &self.pack.scripts.send,
            &serde_json::json!({
                "userName": params.user_name,
                "content": params.content,
                "type": params.kind,
            }),
        )?;
        let value = self
            .broker
            .execute_script(&params.tab_id, &script, SYNC_SCRIPT_TIMEOUT)
            .await?;
        let reply: SendReply = decode(value)?;
        Ok(SendReport {
            success: reply.success,
            message_id: reply.message_id,
            error: reply.error,
        })
    }

    #[tracing::instrument(
        name = "plugin.scripted.start_monitoring",
        skip_all,
        fields(platform = %params.platform, account_id = params.account_id),
    )]
    async fn start_monitoring(
        &self,
        params: &StartMonitoringParams,
    ) -> Result<MonitorStart, CoreError> {
        let script = invoke(
            &self.pack.scripts.monitor,
            &serde_json::json!({
                "accountId": params.account_id,
                "headless": params.headless,
            }),
        )?;
        let value = match self
            .broker
            .execute_script(&params.tab_id, &script, SCRIPT_TIMEOUT)
            .await
        {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = &e as &dyn std::error::Error, "listener injection failed");
                return Ok(MonitorStart::denied(
                    MonitorDenyReason::ScriptInjectionFailed,
                ));
            }
        };
        let reply: MonitorReply = decode(value)?;
        if reply.success {
            return Ok(MonitorStart::started());
        }
        let deny = match reply.reason.as_deref() {
            Some("validation_failed") => MonitorDenyReason::ValidationFailed,
            Some("already_monitoring") => MonitorDenyReason::AlreadyMonitoring,
            _ => MonitorDenyReason::ScriptInjectionFailed,
        };
        Ok(MonitorStart::denied(deny))
    }
}

/// The validate-capability plugin over a script pack.
pub struct ScriptedValidatePlugin {
    broker: Arc<dyn TabBroker>,
    pack: Arc<ScriptPack>,
}

impl ScriptedValidatePlugin {
    /// Creates the plugin.
    pub fn new(broker: Arc<dyn TabBroker>, pack: Arc<ScriptPack>) -> Self {
        Self { broker, pack }
    }
}

#[async_trait]
impl ValidatePlugin for ScriptedValidatePlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(
            PluginKind::Validate,
            self.pack.platform.clone(),
            self.pack.display_name.clone(),
        )
    }

    #[tracing::instrument(name = "plugin.scripted.validate_cookie", skip_all)]
    async fn validate_cookie(&self, cookie_file: &Utf8Path) -> Result<bool, CoreError> {
        let tab = self
            .broker
            .create_tab(CreateTabParams {
                url: self.pack.probe_url.clone(),
                owner: tabfleet_data_model::LockOwner::Validate,
                headless: true,
                cookie_file: Some(cookie_file.to_owned()),
            })
            .await?;

        let verdict = self
            .broker
            .execute_script(&tab, &self.pack.scripts.validate, SCRIPT_TIMEOUT)
            .await;

        // The probe tab is short-lived; release it before reporting.
        if let Err(e) = self.broker.close_tab(&tab).await {
            tracing::warn!(error = &e as &dyn std::error::Error, "probe tab close failed");
        }

        let value = verdict?;
        let valid = value
            .as_bool()
            .or_else(|| value.get("valid").and_then(serde_json::Value::as_bool))
            .unwrap_or(false);
        Ok(valid)
    }
}

/// The login-capability plugin over a script pack.
pub struct ScriptedLoginPlugin {
    broker: Arc<dyn TabBroker>,
    pack: Arc<ScriptPack>,
}

impl ScriptedLoginPlugin {
    /// Creates the plugin.
    pub fn new(broker: Arc<dyn TabBroker>, pack: Arc<ScriptPack>) -> Self {
        Self { broker, pack }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginStartReply {
    qr_code_url: Option<String>,
}

#[async_trait]
impl LoginPlugin for ScriptedLoginPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(
            PluginKind::Login,
            self.pack.platform.clone(),
            self.pack.display_name.clone(),
        )
    }

    #[tracing::instrument(name = "plugin.scripted.start_login", skip_all, fields(user_id))]
    async fn start_login(&self, _user_id: &str) -> Result<LoginStart, CoreError> {
        let tab = self
            .broker
            .create_tab(CreateTabParams {
                url: self.pack.login_url.clone(),
                owner: tabfleet_data_model::LockOwner::Login,
                headless: true,
                cookie_file: None,
            })
            .await?;

        let value = match self
            .broker
            .execute_script(&tab, &self.pack.scripts.login_start, SCRIPT_TIMEOUT)
            .await
        {
            Ok(value) => value,
            Err(e) => {
                // No QR code means no login; do not leak the tab.
                let _ = self.broker.close_tab(&tab).await;
                return Err(e.into());
            }
        };
        let reply: LoginStartReply = decode(value)?;
        Ok(LoginStart {
            tab_id: Some(tab),
            qr_code_url: reply.qr_code_url,
        })
    }

    async fn cancel_login(&self, tab: &TabId) -> Result<(), CoreError> {
        if let Some(script) = &self.pack.scripts.login_cancel {
            self.broker
                .execute_script(tab, script, SCRIPT_TIMEOUT)
                .await?;
        }
        Ok(())
    }
}

/// The login processor over a script pack: polls the login tab until the QR
/// scan completes, then captures the session cookies.
pub struct ScriptedLoginProcessor {
    broker: Arc<dyn TabBroker>,
    pack: Arc<ScriptPack>,
    cookie_dir: Utf8PathBuf,
    clock: BoxClock,
}

impl ScriptedLoginProcessor {
    /// Creates the processor. Captured bundles land in `cookie_dir`.
    pub fn new(
        broker: Arc<dyn TabBroker>,
        pack: Arc<ScriptPack>,
        cookie_dir: Utf8PathBuf,
        clock: BoxClock,
    ) -> Self {
        Self {
            broker,
            pack,
            cookie_dir,
            clock,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginPollReply {
    status: String,
    account_info: Option<AccountInfo>,
}

#[async_trait]
impl LoginProcessor for ScriptedLoginProcessor {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(
            PluginKind::Login,
            self.pack.platform.clone(),
            format!("{} processor", self.pack.display_name),
        )
    }

    #[tracing::instrument(
        name = "plugin.scripted.process_login",
        skip_all,
        fields(platform = %platform, user_id),
    )]
    async fn process(
        &self,
        tab: &TabId,
        platform: &Platform,
        user_id: &str,
    ) -> Result<LoginCompletion, CoreError> {
        let deadline = tokio::time::Instant::now() + LOGIN_PROCESS_TIMEOUT;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::Timeout {
                    phase: TimeoutPhase::Script,
                    timeout: LOGIN_PROCESS_TIMEOUT,
                });
            }

            let value = self
                .broker
                .execute_script(tab, &self.pack.scripts.login_poll, SCRIPT_TIMEOUT)
                .await?;
            let reply: LoginPollReply = decode(value)?;

            match reply.status.as_str() {
                "completed" => {
                    let stamp = self.clock.now().format("%Y%m%d%H%M%S");
                    let bundle = self
                        .cookie_dir
                        .join(format!("{platform}_{user_id}_{stamp}.json"));
                    self.broker.export_cookies(tab, &bundle).await?;
                    return Ok(LoginCompletion {
                        cookie_file: bundle,
                        account_info: reply.account_info,
                    });
                }
                "failed" => {
                    return Err(CoreError::Transient(anyhow::anyhow!(
                        "platform rejected the login"
                    )));
                }
                _ => tokio::time::sleep(LOGIN_POLL_INTERVAL).await,
            }
        }
    }
}

/// The upload-capability plugin over a script pack.
pub struct ScriptedUploadPlugin {
    broker: Arc<dyn TabBroker>,
    pack: Arc<ScriptPack>,
}

impl ScriptedUploadPlugin {
    /// Creates the plugin.
    pub fn new(broker: Arc<dyn TabBroker>, pack: Arc<ScriptPack>) -> Self {
        Self { broker, pack }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadReply {
    success: bool,
    error: Option<String>,
}

#[async_trait]
impl UploadPlugin for ScriptedUploadPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(
            PluginKind::Upload,
            self.pack.platform.clone(),
            self.pack.display_name.clone(),
        )
    }

    #[tracing::instrument(
        name = "plugin.scripted.upload_video_complete",
        skip_all,
        fields(platform = %request.platform, file = %request.file_path),
    )]
    async fn upload_video_complete(
        &self,
        request: &UploadRequest,
    ) -> Result<UploadOutcome, CoreError> {
        let tab = self
            .broker
            .create_tab(CreateTabParams {
                url: self.pack.upload_url.clone(),
                owner: tabfleet_data_model::LockOwner::Upload,
                headless: true,
                cookie_file: Some(request.cookie_file.clone()),
            })
            .await?;

        // From here on the tab is reported back to the caller either way, so
        // the pipeline can close it on every exit path.
        let outcome = self.drive_upload(&tab, request).await;
        Ok(match outcome {
            Ok(()) => UploadOutcome {
                success: true,
                tab_id: Some(tab),
                error: None,
            },
            Err(e) => UploadOutcome {
                success: false,
                tab_id: Some(tab),
                error: Some(e.to_string()),
            },
        })
    }

    #[tracing::instrument(name = "plugin.scripted.account_info", skip_all, fields(tab = %tab))]
    async fn account_info(&self, tab: &TabId) -> Result<AccountInfo, CoreError> {
        let value = self
            .broker
            .execute_script(tab, &self.pack.scripts.account_info, SCRIPT_TIMEOUT)
            .await?;
        decode(value)
    }
}

impl ScriptedUploadPlugin {
    async fn drive_upload(&self, tab: &TabId, request: &UploadRequest) -> Result<(), CoreError> {
        self.broker
            .attach_file(tab, &self.pack.file_input_selector, &request.file_path)
            .await?;

        let script = invoke(
            &self.pack.scripts.upload_publish,
            &serde_json::json!({
                "title": request.title,
                "tags": request.tags,
                "category": request.category,
                "publishAt": request.publish_at,
                "enableOriginal": request.enable_original,
                "addToCollection": request.add_to_collection,
            }),
        )?;
        let value = self
            .broker
            .execute_script(tab, &script, UPLOAD_SCRIPT_TIMEOUT)
            .await?;
        let reply: UploadReply = decode(value)?;
        if !reply.success {
            return Err(CoreError::Transient(anyhow::anyhow!(
                "upload flow failed: {}",
                reply.error.unwrap_or_else(|| "unspecified".to_owned())
            )));
        }
        Ok(())
    }
}
