// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The login coordinator.
//!
//! `start_login` opens the QR tab and returns immediately; a background task
//! waits for the scan through the platform's login processor and settles the
//! record. Whatever happens in there, the tab is closed on the way out. A
//! janitor deletes records that have been terminal for more than a day.

use std::{collections::HashMap, sync::Arc, sync::Mutex, sync::MutexGuard, time::Duration};

use serde::Serialize;
use tabfleet_data_model::{
    Account, AccountStatus, LoginRecord, LoginStatus, Platform, PluginKind, TabId,
};
use tabfleet_storage::{BoxClock, BoxRepositoryFactory, Clock as _, Repository as _, RepositoryAccess};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use ulid::Ulid;

use crate::{broker::TabBroker, error::CoreError, registry::PluginRegistry};

/// Gap between jobs of a batch login.
const BATCH_GAP: Duration = Duration::from_secs(1);
/// Poll cadence while waiting for a batch to settle.
const BATCH_POLL: Duration = Duration::from_secs(5);
/// Default overall budget for waiting on a batch.
const BATCH_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Cadence of the janitor.
const JANITOR_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// How long a terminal record is kept before the janitor deletes it.
const RECORD_RETENTION_HOURS: i64 = 24;

/// Final partition of a batch login wait.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchLoginOutcome {
    /// Users whose login completed.
    pub completed: Vec<String>,
    /// Users still pending when the wait gave up.
    pub pending: Vec<String>,
    /// Users whose login failed or was cancelled.
    pub failed: Vec<String>,
}

/// Async QR-login state machine with a background completion processor.
pub struct LoginCoordinator {
    registry: Arc<PluginRegistry>,
    broker: Arc<dyn TabBroker>,
    repos: BoxRepositoryFactory,
    clock: BoxClock,
    records: Mutex<HashMap<String, LoginRecord>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl LoginCoordinator {
    /// Creates the coordinator.
    #[must_use]
    pub fn new(
        registry: Arc<PluginRegistry>,
        broker: Arc<dyn TabBroker>,
        repos: BoxRepositoryFactory,
        clock: BoxClock,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            broker,
            repos,
            clock,
            records: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            cancel,
        })
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, LoginRecord>> {
        self.records.lock().expect("login records poisoned")
    }

    /// Starts a QR login for the user.
    ///
    /// At most one pending login may exist per user. The returned record
    /// carries the QR code URL; completion happens in the background and is
    /// observed via [`Self::status`].
    #[tracing::instrument(
        name = "login.start",
        skip_all,
        fields(platform = %platform, user_id = %user_id),
    )]
    pub async fn start_login(
        self: &Arc<Self>,
        platform: Platform,
        user_id: String,
    ) -> Result<LoginRecord, CoreError> {
        {
            let mut records = self.records();
            if records
                .get(&user_id)
                .is_some_and(|r| r.status == LoginStatus::Pending)
            {
                return Err(CoreError::validation(format!(
                    "a login is already pending for user {user_id}"
                )));
            }
            // Reserve the slot before any suspension point so concurrent
            // starts for the same user cannot race past the check.
            records.insert(
                user_id.clone(),
                LoginRecord::pending(platform.clone(), user_id.clone(), self.clock.now()),
            );
        }

        let Some(plugin) = self.registry.login(&platform) else {
            self.records().remove(&user_id);
            return Err(CoreError::PluginUnavailable {
                kind: PluginKind::Login,
                platform,
            });
        };

        let start = match plugin.start_login(&user_id).await {
            Ok(start) => start,
            Err(e) => {
                let now = self.clock.now();
                let mut records = self.records();
                if let Some(record) = records.get_mut(&user_id) {
                    record.status = LoginStatus::Failed;
                    record.ended_at = Some(now);
                }
                return Err(e);
            }
        };

        let record = {
            let mut records = self.records();
            let record = records
                .get_mut(&user_id)
                .ok_or(CoreError::NotFound { entity: "login" })?;
            record.tab_id = start.tab_id.clone();
            record.qr_code_url = start.qr_code_url.clone();
            record.clone()
        };

        match start.tab_id {
            Some(tab_id) => {
                let coordinator = self.clone();
                let platform = platform.clone();
                let user = user_id.clone();
                self.tracker.spawn(async move {
                    coordinator.process_login(platform, user, tab_id).await;
                });
            }
            None => {
                // Without a tab there is nothing for the processor to watch.
                let now = self.clock.now();
                let mut records = self.records();
                if let Some(record) = records.get_mut(&user_id) {
                    record.status = LoginStatus::Failed;
                    record.ended_at = Some(now);
                }
                return Err(CoreError::Transient(anyhow::anyhow!(
                    "login plugin returned no tab"
                )));
            }
        }

        Ok(record)
    }

    /// The background half of a login: block on the processor, settle the
    /// record, and close the tab no matter what.
    async fn process_login(self: &Arc<Self>, platform: Platform, user_id: String, tab_id: TabId) {
        let result = match self.registry.login_processor(&platform) {
            Some(processor) => processor.process(&tab_id, &platform, &user_id).await,
            None => Err(CoreError::PluginUnavailable {
                kind: PluginKind::Login,
                platform: platform.clone(),
            }),
        };

        // The tab is closed on every exit, the failure paths included.
        if let Err(e) = self.broker.close_tab(&tab_id).await {
            tracing::debug!(
                error = &e as &dyn std::error::Error,
                tab = %tab_id,
                "login tab close failed",
            );
        }

        let now = self.clock.now();
        let completion = match result {
            Ok(completion) => {
                let mut records = self.records();
                let Some(record) = records.get_mut(&user_id) else {
                    return;
                };
                // A cancellation may have settled the record first.
                if record.status != LoginStatus::Pending {
                    return;
                }
                record.status = LoginStatus::Completed;
                record.ended_at = Some(now);
                record.cookie_file = Some(completion.cookie_file.clone());
                record.account_info = completion.account_info.clone();
                tracing::info!(user_id, %platform, "login completed");
                completion
            }
            Err(e) => {
                let mut records = self.records();
                if let Some(record) = records.get_mut(&user_id) {
                    if record.status == LoginStatus::Pending {
                        record.status = LoginStatus::Failed;
                        record.ended_at = Some(now);
                    }
                }
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    user_id,
                    %platform,
                    "login failed",
                );
                return;
            }
        };

        // Persist the freshly captured account so the rest of the system can
        // schedule and monitor it.
        let account_id = completion
            .account_info
            .as_ref()
            .and_then(|info| info.account_id.clone())
            .unwrap_or_else(|| user_id.clone());
        let user_name = completion
            .account_info
            .as_ref()
            .and_then(|info| info.nickname.clone())
            .unwrap_or_else(|| user_id.clone());
        let account = Account {
            id: Ulid::new(),
            platform: platform.clone(),
            account_id,
            user_name,
            cookie_file: completion.cookie_file,
            status: AccountStatus::Valid,
            last_check_time: Some(now),
            group_id: None,
            can_monitor: true,
        };

        let persisted = async {
            let mut repo = self.repos.create().await?;
            repo.account().upsert(account).await?;
            repo.save().await
        }
        .await;
        if let Err(e) = persisted {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                user_id,
                "failed to persist logged-in account",
            );
        }
    }

    /// Cancels a pending login.
    #[tracing::instrument(name = "login.cancel", skip_all, fields(user_id))]
    pub async fn cancel_login(&self, user_id: &str) -> Result<LoginRecord, CoreError> {
        let (record, platform, tab_id) = {
            let mut records = self.records();
            let record = records
                .get_mut(user_id)
                .ok_or(CoreError::NotFound { entity: "login" })?;
            if record.status != LoginStatus::Pending {
                return Err(CoreError::validation(format!(
                    "login for user {user_id} is not pending"
                )));
            }
            record.status = LoginStatus::Cancelled;
            record.ended_at = Some(self.clock.now());
            (record.clone(), record.platform.clone(), record.tab_id.clone())
        };

        if let Some(tab_id) = tab_id {
            if let Some(plugin) = self.registry.login(&platform) {
                if let Err(e) = plugin.cancel_login(&tab_id).await {
                    tracing::debug!(
                        error = &e as &dyn std::error::Error,
                        "plugin cancel_login failed",
                    );
                }
            }
            // Closing the tab is what the background processor observes.
            let _ = self.broker.close_tab(&tab_id).await;
        }

        Ok(record)
    }

    /// The record for a user.
    #[must_use]
    pub fn status(&self, user_id: &str) -> Option<LoginRecord> {
        self.records().get(user_id).cloned()
    }

    /// Snapshot of every record.
    #[must_use]
    pub fn all(&self) -> Vec<LoginRecord> {
        self.records().values().cloned().collect()
    }

    /// Starts logins serially, one second apart, collecting each start's
    /// outcome. A failed start never aborts the batch.
    pub async fn batch_login(
        self: &Arc<Self>,
        requests: Vec<(Platform, String)>,
    ) -> Vec<Result<LoginRecord, CoreError>> {
        let mut results = Vec::with_capacity(requests.len());
        let total = requests.len();
        for (index, (platform, user_id)) in requests.into_iter().enumerate() {
            results.push(self.start_login(platform, user_id).await);
            if index + 1 < total {
                tokio::time::sleep(BATCH_GAP).await;
            }
        }
        results
    }

    /// Polls until every listed login settles or the timeout elapses, then
    /// partitions the users by final status.
    pub async fn wait_for_batch_login_complete(
        &self,
        user_ids: &[String],
        timeout: Option<Duration>,
    ) -> BatchLoginOutcome {
        let deadline = tokio::time::Instant::now() + timeout.unwrap_or(BATCH_WAIT_TIMEOUT);
        loop {
            let outcome = self.partition(user_ids);
            if outcome.pending.is_empty() || tokio::time::Instant::now() >= deadline {
                return outcome;
            }
            let remaining = deadline - tokio::time::Instant::now();
            tokio::time::sleep(BATCH_POLL.min(remaining)).await;
        }
    }

    fn partition(&self, user_ids: &[String]) -> BatchLoginOutcome {
        let records = self.records();
        let mut outcome = BatchLoginOutcome::default();
        for user_id in user_ids {
            match records.get(user_id).map(|r| r.status) {
                Some(LoginStatus::Completed) => outcome.completed.push(user_id.clone()),
                Some(LoginStatus::Pending) => outcome.pending.push(user_id.clone()),
                Some(LoginStatus::Failed | LoginStatus::Cancelled) | None => {
                    outcome.failed.push(user_id.clone());
                }
            }
        }
        outcome
    }

    /// Deletes records that have been terminal for longer than the retention
    /// window. Returns how many were reaped.
    pub fn janitor_pass(&self) -> usize {
        let now = self.clock.now();
        let retention = chrono::Duration::hours(RECORD_RETENTION_HOURS);
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| {
            !(record.status.is_terminal() && now - record.reaping_reference() > retention)
        });
        let reaped = before - records.len();
        if reaped > 0 {
            tracing::info!(reaped, "login janitor reaped stale records");
        }
        reaped
    }

    /// Arms the hourly janitor.
    pub fn spawn_janitor(self: &Arc<Self>) {
        let coordinator = self.clone();
        let token = self.cancel.clone();
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(JANITOR_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        coordinator.janitor_pass();
                    }
                }
            }
        });
    }

    /// Stops background work and waits for it to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use tabfleet_data_model::{LoginStatus, Platform};
    use tabfleet_storage::{
        AccountFilter, ManualClock, RepositoryAccess, RepositoryFactory,
    };
    use tabfleet_storage_mem::MemRepositoryFactory;
    use tokio_util::sync::CancellationToken;

    use super::LoginCoordinator;
    use crate::{
        registry::PluginRegistry,
        testing::{FakeBroker, FakeLoginPlugin, FakeLoginProcessor},
    };

    struct Setup {
        coordinator: Arc<LoginCoordinator>,
        broker: Arc<FakeBroker>,
        processor: Arc<FakeLoginProcessor>,
        repos: Arc<MemRepositoryFactory>,
        clock: ManualClock,
    }

    fn setup() -> Setup {
        let broker = Arc::new(FakeBroker::new());
        let processor = Arc::new(FakeLoginProcessor::new());
        let registry = Arc::new(
            PluginRegistry::builder()
                .login(Ok(Arc::new(FakeLoginPlugin::new("wechat", broker.clone()))))
                .login_processor(Ok(processor.clone()))
                .build()
                .unwrap(),
        );
        let repos = Arc::new(MemRepositoryFactory::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap());
        let coordinator = LoginCoordinator::new(
            registry,
            broker.clone(),
            repos.clone(),
            Arc::new(clock.clone()),
            CancellationToken::new(),
        );
        Setup {
            coordinator,
            broker,
            processor,
            repos,
            clock,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_pending_login_per_user() {
        let s = setup();
        s.processor.hold();

        let record = s
            .coordinator
            .start_login(Platform::new("wechat"), "alice".to_owned())
            .await
            .unwrap();
        assert_eq!(record.status, LoginStatus::Pending);
        assert!(record.qr_code_url.is_some());

        let err = s
            .coordinator
            .start_login(Platform::new("wechat"), "alice".to_owned())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already pending"));
    }

    #[tokio::test(start_paused = true)]
    async fn completion_settles_the_record_closes_the_tab_and_persists_the_account() {
        let s = setup();

        s.coordinator
            .start_login(Platform::new("wechat"), "alice".to_owned())
            .await
            .unwrap();

        // Let the background processor settle.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let record = s.coordinator.status("alice").unwrap();
        assert_eq!(record.status, LoginStatus::Completed);
        assert!(record.cookie_file.is_some());
        assert!(record.ended_at.is_some());
        assert_eq!(s.broker.open_tab_count(), 0);

        let mut repo = s.repos.create().await.unwrap();
        let accounts = repo.account().list(AccountFilter::new()).await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].platform, Platform::new("wechat"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_settles_the_record_and_the_processor_keeps_it_cancelled() {
        let s = setup();
        s.processor.hold();

        s.coordinator
            .start_login(Platform::new("wechat"), "alice".to_owned())
            .await
            .unwrap();

        let record = s.coordinator.cancel_login("alice").await.unwrap();
        assert_eq!(record.status, LoginStatus::Cancelled);

        // Release the processor; it must not overwrite the cancellation.
        s.processor.release();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            s.coordinator.status("alice").unwrap().status,
            LoginStatus::Cancelled
        );
        assert_eq!(s.broker.open_tab_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_reaps_day_old_terminal_records_only() {
        let s = setup();

        s.coordinator
            .start_login(Platform::new("wechat"), "alice".to_owned())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            s.coordinator.status("alice").unwrap().status,
            LoginStatus::Completed
        );

        // A second, still-pending login must survive the janitor.
        s.processor.hold();
        s.coordinator
            .start_login(Platform::new("wechat"), "bob".to_owned())
            .await
            .unwrap();

        s.clock.advance(chrono::Duration::hours(25));
        let reaped = s.coordinator.janitor_pass();
        assert_eq!(reaped, 1);
        assert!(s.coordinator.status("alice").is_none());
        assert!(s.coordinator.status("bob").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_wait_partitions_final_statuses() {
        let s = setup();

        // alice completes; bob's processor reports a failure.
        s.processor.push_result(Err(crate::error::CoreError::Transient(
            anyhow::anyhow!("scan timed out"),
        )));

        s.coordinator
            .batch_login(vec![
                (Platform::new("wechat"), "bob".to_owned()),
                (Platform::new("wechat"), "alice".to_owned()),
            ])
            .await;

        let outcome = s
            .coordinator
            .wait_for_batch_login_complete(
                &["alice".to_owned(), "bob".to_owned()],
                Some(Duration::from_secs(30)),
            )
            .await;

        assert_eq!(outcome.completed, vec!["alice".to_owned()]);
        assert_eq!(outcome.failed, vec!["bob".to_owned()]);
        assert!(outcome.pending.is_empty());
    }
}
