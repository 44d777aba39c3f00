// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! Hand-rolled fakes for the broker and the plugin contracts.
//!
//! Used by this crate's tests and by downstream crates (handlers, cli) that
//! need a working core without a browser. Everything is deterministic and
//! configurable through small queues: push behaviours in, observe counters
//! out.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tabfleet_data_model::{
    AccountInfo, LockOwner, MessageKind, Platform, PluginDescriptor, PluginKind, SendReport,
    SyncedMessage, SyncedThread, TabId, TabLock, UploadOutcome, UploadRequest,
};
use tokio::sync::Notify;
use ulid::Ulid;
use url::Url;

use crate::{
    broker::{BrokerError, CreateTabParams, TabBroker, UrlChange},
    error::CoreError,
    plugin::{
        LoginCompletion, LoginPlugin, LoginProcessor, LoginStart, MessagePlugin, MonitorStart,
        SendParams, StartMonitoringParams, SyncBatch, SyncParams, UploadPlugin, ValidatePlugin,
    },
};

/// Scriptable replacement for the script-execution behaviour of a tab.
type ScriptHandler =
    Box<dyn Fn(&TabId, &str) -> Result<serde_json::Value, BrokerError> + Send + Sync>;

struct FakeTab {
    url: String,
    lock: TabLock,
    unresponsive: bool,
}

#[derive(Default)]
struct FakeBrokerState {
    next_id: u64,
    tabs: HashMap<TabId, FakeTab>,
    created: u64,
    closed: u64,
    url_changes: VecDeque<UrlChange>,
    attached_files: Vec<(TabId, String, Utf8PathBuf)>,
    exported_cookies: Vec<(TabId, Utf8PathBuf)>,
}

/// An in-memory [`TabBroker`].
///
/// Scripts resolve to `true` unless a handler is installed or the tab was
/// made unresponsive. URL-change waits pop a configured queue and fall back
/// to an immediate navigation.
pub struct FakeBroker {
    state: Mutex<FakeBrokerState>,
    script_handler: Mutex<Option<ScriptHandler>>,
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBroker {
    /// Creates an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeBrokerState::default()),
            script_handler: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeBrokerState> {
        self.state.lock().expect("fake broker state poisoned")
    }

    /// Installs a handler deciding what scripts resolve with.
    pub fn set_script_handler<F>(&self, handler: F)
    where
        F: Fn(&TabId, &str) -> Result<serde_json::Value, BrokerError> + Send + Sync + 'static,
    {
        *self
            .script_handler
            .lock()
            .expect("fake broker handler poisoned") = Some(Box::new(handler));
    }

    /// Makes a tab's scripts fail from now on, as a hung page would.
    pub fn set_unresponsive(&self, tab: &TabId, unresponsive: bool) {
        if let Some(entry) = self.state().tabs.get_mut(tab) {
            entry.unresponsive = unresponsive;
        }
    }

    /// Overrides a tab's current URL.
    pub fn set_tab_url(&self, tab: &TabId, url: impl Into<String>) {
        if let Some(entry) = self.state().tabs.get_mut(tab) {
            entry.url = url.into();
        }
    }

    /// Queues the outcome of the next URL-change wait.
    pub fn push_url_change(&self, change: UrlChange) {
        self.state().url_changes.push_back(change);
    }

    /// Kills a tab out from under its owner, as a crashed page would.
    pub fn kill_tab(&self, tab: &TabId) {
        self.state().tabs.remove(tab);
    }

    /// Tabs currently open.
    #[must_use]
    pub fn open_tab_count(&self) -> usize {
        self.state().tabs.len()
    }

    /// Tabs created over the fake's lifetime.
    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.state().created
    }

    /// Tabs closed over the fake's lifetime.
    #[must_use]
    pub fn closed_count(&self) -> u64 {
        self.state().closed
    }

    /// Files streamed into tabs.
    #[must_use]
    pub fn attached_files(&self) -> Vec<(TabId, String, Utf8PathBuf)> {
        self.state().attached_files.clone()
    }

    /// Cookie bundles exported from tabs.
    #[must_use]
    pub fn exported_cookies(&self) -> Vec<(TabId, Utf8PathBuf)> {
        self.state().exported_cookies.clone()
    }
}

#[async_trait]
impl TabBroker for FakeBroker {
    async fn create_tab(&self, params: CreateTabParams) -> Result<TabId, BrokerError> {
        let mut state = self.state();
        state.next_id += 1;
        state.created += 1;
        let tab = TabId::new(format!("tab-{}", state.next_id));
        state.tabs.insert(
            tab.clone(),
            FakeTab {
                url: params.url.to_string(),
                lock: TabLock {
                    owner: params.owner,
                    acquired_at: Utc::now(),
                },
                unresponsive: false,
            },
        );
        Ok(tab)
    }

    async fn close_tab(&self, tab: &TabId) -> Result<(), BrokerError> {
        let mut state = self.state();
        if state.tabs.remove(tab).is_none() {
            return Err(BrokerError::UnknownTab(tab.clone()));
        }
        state.closed += 1;
        Ok(())
    }

    async fn tab_exists(&self, tab: &TabId) -> bool {
        self.state().tabs.contains_key(tab)
    }

    async fn lock(&self, tab: &TabId) -> Result<Option<TabLock>, BrokerError> {
        Ok(self.state().tabs.get(tab).map(|t| t.lock))
    }

    async fn navigate(&self, tab: &TabId, url: &Url) -> Result<(), BrokerError> {
        let mut state = self.state();
        let entry = state
            .tabs
            .get_mut(tab)
            .ok_or_else(|| BrokerError::UnknownTab(tab.clone()))?;
        entry.url = url.to_string();
        Ok(())
    }

    async fn current_url(&self, tab: &TabId) -> Result<String, BrokerError> {
        self.state()
            .tabs
            .get(tab)
            .map(|t| t.url.clone())
            .ok_or_else(|| BrokerError::UnknownTab(tab.clone()))
    }

    async fn execute_script(
        &self,
        tab: &TabId,
        script: &str,
        _timeout: Duration,
    ) -> Result<serde_json::Value, BrokerError> {
        {
            let state = self.state();
            let entry = state
                .tabs
                .get(tab)
                .ok_or_else(|| BrokerError::UnknownTab(tab.clone()))?;
            if entry.unresponsive {
                return Err(BrokerError::Script("script did not resolve".to_owned()));
            }
        }
        let handler = self
            .script_handler
            .lock()
            .expect("fake broker handler poisoned");
        match handler.as_ref() {
            Some(handler) => handler(tab, script),
            None => Ok(serde_json::Value::Bool(true)),
        }
    }

    async fn wait_for_url_change(
        &self,
        tab: &TabId,
        _timeout: Duration,
    ) -> Result<UrlChange, BrokerError> {
        let mut state = self.state();
        if !state.tabs.contains_key(tab) {
            return Err(BrokerError::UnknownTab(tab.clone()));
        }
        Ok(state
            .url_changes
            .pop_front()
            .unwrap_or_else(|| UrlChange::Changed("https://platform.example/published".to_owned())))
    }

    async fn attach_file(
        &self,
        tab: &TabId,
        selector: &str,
        file: &Utf8Path,
    ) -> Result<(), BrokerError> {
        let mut state = self.state();
        if !state.tabs.contains_key(tab) {
            return Err(BrokerError::UnknownTab(tab.clone()));
        }
        state
            .attached_files
            .push((tab.clone(), selector.to_owned(), file.to_owned()));
        Ok(())
    }

    async fn export_cookies(&self, tab: &TabId, dest: &Utf8Path) -> Result<(), BrokerError> {
        let mut state = self.state();
        if !state.tabs.contains_key(tab) {
            return Err(BrokerError::UnknownTab(tab.clone()));
        }
        state.exported_cookies.push((tab.clone(), dest.to_owned()));
        Ok(())
    }
}

/// A [`MessagePlugin`] with scriptable sync/monitor outcomes.
pub struct FakeMessagePlugin {
    platform: Platform,
    readiness: Option<String>,
    sync_results: Mutex<VecDeque<Result<SyncBatch, CoreError>>>,
    monitor_results: Mutex<VecDeque<MonitorStart>>,
    sync_calls: AtomicUsize,
    monitor_calls: Mutex<Vec<(String, tokio::time::Instant)>>,
}

impl FakeMessagePlugin {
    /// Creates a plugin for the platform, with no readiness probe.
    #[must_use]
    pub fn new(platform: &str) -> Self {
        Self {
            platform: Platform::new(platform),
            readiness: None,
            sync_results: Mutex::new(VecDeque::new()),
            monitor_results: Mutex::new(VecDeque::new()),
            sync_calls: AtomicUsize::new(0),
            monitor_calls: Mutex::new(Vec::new()),
        }
    }

    /// Declares a readiness probe script.
    #[must_use]
    pub fn with_readiness(mut self, script: &str) -> Self {
        self.readiness = Some(script.to_owned());
        self
    }

    /// Queues the outcome of the next sync.
    pub fn push_sync_result(&self, result: Result<SyncBatch, CoreError>) {
        self.sync_results
            .lock()
            .expect("fake plugin state poisoned")
            .push_back(result);
    }

    /// Queues the outcome of the next monitoring start.
    pub fn push_monitor_result(&self, result: MonitorStart) {
        self.monitor_results
            .lock()
            .expect("fake plugin state poisoned")
            .push_back(result);
    }

    /// Syncs served so far.
    #[must_use]
    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }

    /// `(account_id, virtual instant)` of each monitoring start.
    #[must_use]
    pub fn monitor_calls(&self) -> Vec<(String, tokio::time::Instant)> {
        self.monitor_calls
            .lock()
            .expect("fake plugin state poisoned")
            .clone()
    }

    fn default_batch() -> SyncBatch {
        SyncBatch {
            success: true,
            threads: vec![SyncedThread {
                peer_id: "peer-1".to_owned(),
                peer_name: "Peer One".to_owned(),
                peer_avatar: None,
                messages: vec![
                    SyncedMessage {
                        platform_message_id: format!("m-{}", Ulid::new()),
                        direction: tabfleet_data_model::MessageDirection::Inbound,
                        kind: MessageKind::Text,
                        content: "hello".to_owned(),
                        sent_at: Utc::now(),
                    },
                    SyncedMessage {
                        platform_message_id: format!("m-{}", Ulid::new()),
                        direction: tabfleet_data_model::MessageDirection::Inbound,
                        kind: MessageKind::Text,
                        content: "again".to_owned(),
                        sent_at: Utc::now(),
                    },
                ],
            }],
            errors: Vec::new(),
            sync_time: Utc::now(),
        }
    }
}

#[async_trait]
impl MessagePlugin for FakeMessagePlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(PluginKind::Message, self.platform.clone(), "fake messages")
    }

    fn message_url(&self) -> Url {
        Url::parse("https://platform.example/messages").expect("static url")
    }

    fn readiness_script(&self) -> Option<String> {
        self.readiness.clone()
    }

    async fn sync_messages(&self, _params: &SyncParams) -> Result<SyncBatch, CoreError> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        let queued = self
            .sync_results
            .lock()
            .expect("fake plugin state poisoned")
            .pop_front();
        match queued {
            Some(result) => result,
            None => Ok(Self::default_batch()),
        }
    }

    async fn send_message(&self, _params: &SendParams) -> Result<SendReport, CoreError> {
        Ok(SendReport {
            success: true,
            message_id: Some("sent-1".to_owned()),
            error: None,
        })
    }

    async fn start_monitoring(
        &self,
        params: &StartMonitoringParams,
    ) -> Result<MonitorStart, CoreError> {
        self.monitor_calls
            .lock()
            .expect("fake plugin state poisoned")
            .push((params.account_id.clone(), tokio::time::Instant::now()));
        let queued = self
            .monitor_results
            .lock()
            .expect("fake plugin state poisoned")
            .pop_front();
        Ok(queued.unwrap_or_else(MonitorStart::started))
    }
}

/// A [`ValidatePlugin`] answering from a queue, `true` by default.
pub struct FakeValidatePlugin {
    platform: Platform,
    verdicts: Mutex<VecDeque<bool>>,
    calls: AtomicUsize,
}

impl FakeValidatePlugin {
    /// Creates the plugin.
    #[must_use]
    pub fn new(platform: &str) -> Self {
        Self {
            platform: Platform::new(platform),
            verdicts: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queues the next verdict.
    pub fn push_verdict(&self, valid: bool) {
        self.verdicts
            .lock()
            .expect("fake plugin state poisoned")
            .push_back(valid);
    }

    /// Validations served so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ValidatePlugin for FakeValidatePlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(PluginKind::Validate, self.platform.clone(), "fake validator")
    }

    async fn validate_cookie(&self, _cookie_file: &Utf8Path) -> Result<bool, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let queued = self
            .verdicts
            .lock()
            .expect("fake plugin state poisoned")
            .pop_front();
        Ok(queued.unwrap_or(true))
    }
}

/// An [`UploadPlugin`] that acquires a real (fake) tab and succeeds unless
/// told otherwise.
pub struct FakeUploadPlugin {
    platform: Platform,
    broker: Arc<dyn TabBroker>,
    outcomes: Mutex<VecDeque<bool>>,
    calls: AtomicUsize,
}

impl FakeUploadPlugin {
    /// Creates the plugin.
    #[must_use]
    pub fn new(platform: &str, broker: Arc<dyn TabBroker>) -> Self {
        Self {
            platform: Platform::new(platform),
            broker,
            outcomes: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queues whether the next upload succeeds.
    pub fn push_outcome(&self, success: bool) {
        self.outcomes
            .lock()
            .expect("fake plugin state poisoned")
            .push_back(success);
    }

    /// Uploads served so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UploadPlugin for FakeUploadPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(PluginKind::Upload, self.platform.clone(), "fake uploader")
    }

    async fn upload_video_complete(
        &self,
        request: &UploadRequest,
    ) -> Result<UploadOutcome, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let tab = self
            .broker
            .create_tab(CreateTabParams {
                url: Url::parse("https://platform.example/upload").expect("static url"),
                owner: LockOwner::Upload,
                headless: true,
                cookie_file: Some(request.cookie_file.clone()),
            })
            .await?;
        let success = self
            .outcomes
            .lock()
            .expect("fake plugin state poisoned")
            .pop_front()
            .unwrap_or(true);
        Ok(UploadOutcome {
            success,
            tab_id: Some(tab),
            error: (!success).then(|| "platform rejected the upload".to_owned()),
        })
    }

    async fn account_info(&self, _tab: &TabId) -> Result<AccountInfo, CoreError> {
        Ok(AccountInfo {
            account_id: Some("alice".to_owned()),
            nickname: Some("Alice".to_owned()),
            avatar_url: None,
        })
    }
}

/// A [`LoginPlugin`] that opens a real (fake) tab and hands out a QR URL.
pub struct FakeLoginPlugin {
    platform: Platform,
    broker: Arc<dyn TabBroker>,
    cancels: AtomicU64,
}

impl FakeLoginPlugin {
    /// Creates the plugin.
    #[must_use]
    pub fn new(platform: &str, broker: Arc<dyn TabBroker>) -> Self {
        Self {
            platform: Platform::new(platform),
            broker,
            cancels: AtomicU64::new(0),
        }
    }

    /// Cancels observed so far.
    #[must_use]
    pub fn cancel_calls(&self) -> u64 {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoginPlugin for FakeLoginPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(PluginKind::Login, self.platform.clone(), "fake login")
    }

    async fn start_login(&self, _user_id: &str) -> Result<LoginStart, CoreError> {
        let tab = self
            .broker
            .create_tab(CreateTabParams {
                url: Url::parse("https://platform.example/login").expect("static url"),
                owner: LockOwner::Login,
                headless: true,
                cookie_file: None,
            })
            .await?;
        Ok(LoginStart {
            tab_id: Some(tab),
            qr_code_url: Some("https://platform.example/qr.png".to_owned()),
        })
    }

    async fn cancel_login(&self, _tab: &TabId) -> Result<(), CoreError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A [`LoginProcessor`] that completes immediately, or blocks until
/// released when held.
pub struct FakeLoginProcessor {
    platform: Platform,
    held: Mutex<bool>,
    release: Notify,
    results: Mutex<VecDeque<Result<LoginCompletion, CoreError>>>,
}

impl Default for FakeLoginProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLoginProcessor {
    /// Creates the processor for the `wechat` test platform.
    #[must_use]
    pub fn new() -> Self {
        Self {
            platform: Platform::new("wechat"),
            held: Mutex::new(false),
            release: Notify::new(),
            results: Mutex::new(VecDeque::new()),
        }
    }

    /// Makes subsequent `process` calls block until [`Self::release`].
    pub fn hold(&self) {
        *self.held.lock().expect("fake processor state poisoned") = true;
    }

    /// Unblocks held `process` calls.
    pub fn release(&self) {
        *self.held.lock().expect("fake processor state poisoned") = false;
        self.release.notify_waiters();
    }

    /// Queues the outcome of the next `process`.
    pub fn push_result(&self, result: Result<LoginCompletion, CoreError>) {
        self.results
            .lock()
            .expect("fake processor state poisoned")
            .push_back(result);
    }
}

#[async_trait]
impl LoginProcessor for FakeLoginProcessor {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(PluginKind::Login, self.platform.clone(), "fake processor")
    }

    async fn process(
        &self,
        _tab: &TabId,
        platform: &Platform,
        user_id: &str,
    ) -> Result<LoginCompletion, CoreError> {
        loop {
            let notified = self.release.notified();
            if !*self.held.lock().expect("fake processor state poisoned") {
                break;
            }
            notified.await;
        }
        let queued = self
            .results
            .lock()
            .expect("fake processor state poisoned")
            .pop_front();
        match queued {
            Some(result) => result,
            None => Ok(LoginCompletion {
                cookie_file: Utf8PathBuf::from(format!("/cookies/{platform}_{user_id}_1.json")),
                account_info: Some(AccountInfo {
                    account_id: Some(user_id.to_owned()),
                    nickname: Some(user_id.to_owned()),
                    avatar_url: None,
                }),
            }),
        }
    }
}
