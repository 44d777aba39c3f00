// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The monitoring orchestrator.
//!
//! Implements the "start monitoring" workflow: an optional batched sync
//! phase across the requested accounts, then a serial listen phase that
//! installs the inbox listener into each account's custodian tab. With no
//! accounts given, candidates are discovered from the account store.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tabfleet_data_model::{
    AccountRef, MonitorDenyReason, Platform, PluginKind, TabId,
};
use tabfleet_storage::{BoxClock, BoxRepositoryFactory, Clock as _, Repository as _, RepositoryAccess};

use crate::{
    custodian::MessageTabCustodian,
    error::CoreError,
    plugin::StartMonitoringParams,
    registry::PluginRegistry,
    scheduler::SyncScheduler,
    sync::{BatchSyncOptions, BatchSyncReport, SyncEngine},
};

/// Gap between serial listen starts.
const START_GAP: Duration = Duration::from_secs(1);

/// Tunables of the monitoring workflow.
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Accounts synced at once during the sync phase.
    pub sync_concurrency: usize,
    /// Budget per account during the sync phase.
    pub sync_timeout: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            sync_concurrency: 5,
            sync_timeout: Duration::from_secs(30),
        }
    }
}

/// One account under active monitoring.
#[derive(Debug, Clone)]
struct MonitoringEntry {
    account: AccountRef,
    started_at: DateTime<Utc>,
    headless: bool,
}

/// Outcome of starting monitoring for one account.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleStartOutcome {
    /// Platform of the account.
    pub platform: Platform,
    /// The account.
    pub account_id: String,
    /// The canonical account key.
    pub account_key: String,
    /// Whether the listener is installed.
    pub success: bool,
    /// The stable deny reason, when the platform refused.
    pub reason: Option<MonitorDenyReason>,
    /// Operator-facing message for the outcome.
    pub message: Option<String>,
}

/// Aggregate outcome of a batch start.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStartReport {
    /// Accounts the workflow covered.
    pub total: usize,
    /// Listeners installed.
    pub success_count: usize,
    /// Starts that failed for reasons other than an invalid session.
    pub failed_count: usize,
    /// Starts denied because the session is no longer valid.
    pub validation_failed_count: usize,
    /// Per-account outcomes, in dispatch order.
    pub results: Vec<SingleStartOutcome>,
    /// The sync phase's report, when the phase ran.
    pub sync: Option<BatchSyncReport>,
}

/// Status row for one monitored account.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStatusEntry {
    /// The canonical account key.
    pub account_key: String,
    /// Platform of the account.
    pub platform: Platform,
    /// The account.
    pub account_id: String,
    /// The custodian's tab, when one is currently alive.
    pub tab_id: Option<TabId>,
    /// When monitoring started.
    pub started_at: DateTime<Utc>,
    /// Whether the tab runs without a visible window.
    pub headless: bool,
}

/// The sync-then-listen workflow over many accounts.
pub struct MonitoringOrchestrator {
    config: MonitoringConfig,
    registry: Arc<PluginRegistry>,
    custodian: Arc<MessageTabCustodian>,
    engine: Arc<SyncEngine>,
    scheduler: Arc<SyncScheduler>,
    repos: BoxRepositoryFactory,
    clock: BoxClock,
    active: Mutex<HashMap<String, MonitoringEntry>>,
}

impl MonitoringOrchestrator {
    /// Creates the orchestrator.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MonitoringConfig,
        registry: Arc<PluginRegistry>,
        custodian: Arc<MessageTabCustodian>,
        engine: Arc<SyncEngine>,
        scheduler: Arc<SyncScheduler>,
        repos: BoxRepositoryFactory,
        clock: BoxClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            custodian,
            engine,
            scheduler,
            repos,
            clock,
            active: Mutex::new(HashMap::new()),
        })
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, MonitoringEntry>> {
        self.active.lock().expect("monitoring state poisoned")
    }

    /// Starts event-driven monitoring for one account.
    #[tracing::instrument(
        name = "monitor.start_single",
        skip_all,
        fields(platform = %account.platform, account_id = account.account_id),
    )]
    pub async fn start_single(&self, account: AccountRef, headless: bool) -> SingleStartOutcome {
        let key = account.key();
        let base = SingleStartOutcome {
            platform: account.platform.clone(),
            account_id: account.account_id.clone(),
            account_key: key.clone(),
            success: false,
            reason: None,
            message: None,
        };

        if self.active().contains_key(&key) {
            return SingleStartOutcome {
                reason: Some(MonitorDenyReason::AlreadyMonitoring),
                message: Some(MonitorDenyReason::AlreadyMonitoring.user_message().to_owned()),
                ..base
            };
        }

        let Some(plugin) = self.registry.message(&account.platform) else {
            let e = CoreError::PluginUnavailable {
                kind: PluginKind::Message,
                platform: account.platform.clone(),
            };
            return SingleStartOutcome {
                message: Some(e.to_string()),
                ..base
            };
        };

        let tab_id = match self
            .custodian
            .ensure_message_tab(&account.platform, &account.account_id, &account.cookie_file)
            .await
        {
            Ok(tab_id) => tab_id,
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    %key,
                    "message tab unavailable for monitoring",
                );
                return SingleStartOutcome {
                    message: Some(e.to_string()),
                    ..base
                };
            }
        };

        let start = plugin
            .start_monitoring(&StartMonitoringParams {
                platform: account.platform.clone(),
                account_id: account.account_id.clone(),
                cookie_file: account.cookie_file.clone(),
                tab_id,
                headless,
            })
            .await;

        match start {
            Ok(start) if start.started => {
                self.active().insert(
                    key.clone(),
                    MonitoringEntry {
                        account: account.clone(),
                        started_at: self.clock.now(),
                        headless,
                    },
                );
                // Monitored accounts also get periodic pulls; the listener
                // only streams what arrives while the tab lives.
                if let Err(e) = self.scheduler.start_for_account(
                    account.platform.clone(),
                    account.account_id.clone(),
                    account.cookie_file.clone(),
                    None,
                ) {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        %key,
                        "scheduler registration failed for monitored account",
                    );
                }
                tracing::info!(%key, "monitoring started");
                SingleStartOutcome {
                    success: true,
                    ..base
                }
            }
            Ok(start) => {
                let reason = start
                    .deny
                    .unwrap_or(MonitorDenyReason::ScriptInjectionFailed);
                // An account the platform refuses must not keep a tab open.
                self.custodian.cleanup(&key).await;
                SingleStartOutcome {
                    reason: Some(reason),
                    message: Some(reason.user_message().to_owned()),
                    ..base
                }
            }
            Err(e) => {
                self.custodian.cleanup(&key).await;
                SingleStartOutcome {
                    message: Some(e.to_string()),
                    ..base
                }
            }
        }
    }

    /// The sync-then-listen batch workflow.
    ///
    /// With `accounts` absent, candidates are discovered from the account
    /// store. The sync phase is opt-in; the listen phase iterates serially
    /// with a one-second gap between accounts.
    #[tracing::instrument(name = "monitor.batch_start", skip_all)]
    pub async fn batch_start(
        &self,
        accounts: Option<Vec<AccountRef>>,
        with_sync: bool,
        sync_options: Option<BatchSyncOptions>,
    ) -> Result<BatchStartReport, CoreError> {
        let accounts = match accounts {
            Some(accounts) => accounts,
            None => self.discover_accounts().await?,
        };

        let mut report = BatchStartReport {
            total: accounts.len(),
            ..BatchStartReport::default()
        };

        if with_sync && !accounts.is_empty() {
            let options = sync_options.unwrap_or(BatchSyncOptions {
                concurrency: self.config.sync_concurrency,
                timeout: self.config.sync_timeout,
                full_sync: false,
            });
            let sync = self.engine.batch_sync(&accounts, options).await;
            tracing::info!(
                accounts = accounts.len(),
                new_messages = sync.total_new_messages,
                "monitoring sync phase finished",
            );
            report.sync = Some(sync);
        }

        let total = accounts.len();
        for (index, account) in accounts.into_iter().enumerate() {
            let outcome = self.start_single(account, true).await;
            if outcome.success {
                report.success_count += 1;
            } else if outcome.reason == Some(MonitorDenyReason::ValidationFailed) {
                report.validation_failed_count += 1;
            } else {
                report.failed_count += 1;
            }
            report.results.push(outcome);
            if index + 1 < total {
                tokio::time::sleep(START_GAP).await;
            }
        }

        Ok(report)
    }

    /// Stops monitoring one account and retires its tab.
    pub async fn stop(&self, account_key: &str) -> Result<(), CoreError> {
        let removed = self.active().remove(account_key);
        if removed.is_none() {
            return Err(CoreError::NotFound {
                entity: "monitored account",
            });
        }
        self.custodian.cleanup(account_key).await;
        tracing::info!(key = account_key, "monitoring stopped");
        Ok(())
    }

    /// Stops every monitored account.
    pub async fn stop_all(&self) -> usize {
        let keys: Vec<String> = { self.active().drain().map(|(key, _)| key).collect() };
        let count = keys.len();
        for key in &keys {
            self.custodian.cleanup(key).await;
        }
        if count > 0 {
            tracing::info!(count, "all monitoring stopped");
        }
        count
    }

    /// Per-account monitoring state.
    pub async fn status(&self) -> Vec<MonitoringStatusEntry> {
        let entries: Vec<(String, MonitoringEntry)> = {
            self.active()
                .iter()
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect()
        };
        let mut rows = Vec::with_capacity(entries.len());
        for (account_key, entry) in entries {
            let tab_id = self
                .custodian
                .record(&account_key)
                .await
                .map(|record| record.tab_id);
            rows.push(MonitoringStatusEntry {
                account_key,
                platform: entry.account.platform.clone(),
                account_id: entry.account.account_id.clone(),
                tab_id,
                started_at: entry.started_at,
                headless: entry.headless,
            });
        }
        rows.sort_by(|a, b| a.account_key.cmp(&b.account_key));
        rows
    }

    /// Whether an account is currently monitored.
    #[must_use]
    pub fn is_monitoring(&self, account_key: &str) -> bool {
        self.active().contains_key(account_key)
    }

    async fn discover_accounts(&self) -> Result<Vec<AccountRef>, CoreError> {
        let mut repo = self.repos.create().await?;
        let accounts = repo.account().monitorable().await?;
        tracing::debug!(candidates = accounts.len(), "auto-discovered monitorable accounts");
        Ok(accounts.iter().map(|a| a.to_ref()).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use camino::Utf8PathBuf;
    use tabfleet_data_model::{
        Account, AccountRef, AccountStatus, MonitorDenyReason, Platform,
    };
    use tabfleet_storage::{RepositoryAccess, RepositoryFactory, SystemClock};
    use tabfleet_storage_mem::MemRepositoryFactory;
    use ulid::Ulid;

    use crate::{
        plugin::MonitorStart,
        registry::PluginRegistry,
        testing::{FakeBroker, FakeMessagePlugin},
        Core, CoreOptions,
    };

    struct Setup {
        core: Arc<Core>,
        broker: Arc<FakeBroker>,
        plugin: Arc<FakeMessagePlugin>,
        repos: Arc<MemRepositoryFactory>,
    }

    fn setup() -> Setup {
        let broker = Arc::new(FakeBroker::new());
        let plugin = Arc::new(FakeMessagePlugin::new("wechat"));
        let registry = Arc::new(
            PluginRegistry::builder()
                .message(Ok(plugin.clone()))
                .build()
                .unwrap(),
        );
        let repos = Arc::new(MemRepositoryFactory::new());
        let core = Core::init(CoreOptions {
            broker: broker.clone(),
            registry,
            repos: repos.clone(),
            clock: Arc::new(SystemClock),
            scheduler: crate::scheduler::SchedulerConfig::default(),
            monitoring: super::MonitoringConfig::default(),
        });
        Setup {
            core,
            broker,
            plugin,
            repos,
        }
    }

    fn account(id: &str) -> AccountRef {
        AccountRef {
            platform: Platform::new("wechat"),
            account_id: id.to_owned(),
            cookie_file: Utf8PathBuf::from(format!("/cookies/wechat_{id}_1.json")),
        }
    }

    async fn seed_account(repos: &MemRepositoryFactory, id: &str) {
        let mut repo = repos.create().await.unwrap();
        repo.account()
            .upsert(Account {
                id: Ulid::new(),
                platform: Platform::new("wechat"),
                account_id: id.to_owned(),
                user_name: id.to_owned(),
                cookie_file: Utf8PathBuf::from(format!("/cookies/wechat_{id}_1.json")),
                status: AccountStatus::Valid,
                last_check_time: None,
                group_id: None,
                can_monitor: true,
            })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn batch_start_discovers_accounts_and_spaces_starts_apart() {
        let s = setup();
        seed_account(&s.repos, "alice").await;
        seed_account(&s.repos, "bob").await;

        let report = s
            .core
            .monitor
            .batch_start(None, false, None)
            .await
            .unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(
            report.success_count + report.failed_count + report.validation_failed_count,
            2
        );
        assert_eq!(report.success_count, 2);

        let calls = s.plugin.monitor_calls();
        assert_eq!(calls.len(), 2);
        assert!(
            calls[1].1 - calls[0].1 >= Duration::from_secs(1),
            "listen starts closer than the serial gap"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn validation_denial_maps_to_the_fixed_message_and_frees_the_tab() {
        let s = setup();
        s.plugin
            .push_monitor_result(MonitorStart::denied(MonitorDenyReason::ValidationFailed));

        let outcome = s.core.monitor.start_single(account("alice"), true).await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason, Some(MonitorDenyReason::ValidationFailed));
        assert_eq!(outcome.message.as_deref(), Some("账号已失效，请重新登录"));

        // The refused account's tab is not kept around.
        assert_eq!(s.broker.open_tab_count(), 0);
        assert!(s.core.custodian.record("wechat_alice").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn a_second_start_is_denied_as_already_monitoring() {
        let s = setup();

        let first = s.core.monitor.start_single(account("alice"), true).await;
        assert!(first.success);

        let second = s.core.monitor.start_single(account("alice"), true).await;
        assert!(!second.success);
        assert_eq!(second.reason, Some(MonitorDenyReason::AlreadyMonitoring));
        assert_eq!(second.message.as_deref(), Some("账号已在监听中"));
    }

    #[tokio::test(start_paused = true)]
    async fn sync_phase_aggregates_new_messages() {
        let s = setup();

        let report = s
            .core
            .monitor
            .batch_start(Some(vec![account("alice"), account("bob")]), true, None)
            .await
            .unwrap();

        let sync = report.sync.expect("sync phase ran");
        // The fake plugin serves two fresh messages per account.
        assert_eq!(sync.total_new_messages, 4);
        assert_eq!(report.success_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_retires_the_tab_and_stop_all_clears_everything() {
        let s = setup();

        s.core.monitor.start_single(account("alice"), true).await;
        s.core.monitor.start_single(account("bob"), true).await;
        assert_eq!(s.core.monitor.status().await.len(), 2);

        s.core.monitor.stop("wechat_alice").await.unwrap();
        assert!(!s.core.monitor.is_monitoring("wechat_alice"));
        assert!(s.core.custodian.record("wechat_alice").await.is_none());

        let stopped = s.core.monitor.stop_all().await;
        assert_eq!(stopped, 1);
        assert_eq!(s.core.monitor.status().await.len(), 0);
    }
}
