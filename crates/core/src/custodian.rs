// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The message-tab custodian.
//!
//! Owns the `account key → tab` mapping and the per-tab metadata. Each
//! monitored account gets one long-lived tab, locked to `owner=message` for
//! the whole monitoring lifetime, and a periodic health task that repairs the
//! tab when it goes bad. The custodian is the only component that mutates a
//! message-tab record.

use std::{collections::HashMap, sync::Arc, time::Duration};

use camino::Utf8Path;
use tabfleet_data_model::{account_key, LockOwner, MessageTabRecord, Platform, TabId};
use tokio::sync::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    broker::{CreateTabParams, TabBroker},
    error::{CoreError, TimeoutPhase},
    registry::PluginRegistry,
};
use tabfleet_storage::{BoxClock, Clock as _};

/// How often a tab's health is re-evaluated.
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);
/// How long a fresh tab may take to pass its readiness probe.
const READINESS_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval while waiting for readiness.
const READINESS_POLL: Duration = Duration::from_secs(1);
/// Backoff after a readiness probe raised instead of resolving.
const READINESS_ERROR_RETRY: Duration = Duration::from_secs(2);
/// Budget for the trivial responsiveness probe.
const RESPONSIVENESS_TIMEOUT: Duration = Duration::from_secs(3);
/// Pause between tearing a bad tab down and re-creating it.
const REPAIR_COOLDOWN: Duration = Duration::from_secs(5);
/// Consecutive failed health checks after which the custodian gives up.
const MAX_REPAIRS: u32 = 3;

#[derive(Default)]
struct Slot {
    record: Option<MessageTabRecord>,
    monitor: Option<CancellationToken>,
}

type SharedSlot = Arc<Mutex<Slot>>;

/// Allocates, health-checks, repairs and retires long-lived per-account
/// message tabs.
pub struct MessageTabCustodian {
    broker: Arc<dyn TabBroker>,
    registry: Arc<PluginRegistry>,
    clock: BoxClock,
    slots: Mutex<HashMap<String, SharedSlot>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl MessageTabCustodian {
    /// Creates the custodian.
    #[must_use]
    pub fn new(
        broker: Arc<dyn TabBroker>,
        registry: Arc<PluginRegistry>,
        clock: BoxClock,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            registry,
            clock,
            slots: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            cancel,
        })
    }

    async fn slot(&self, key: &str) -> SharedSlot {
        let mut slots = self.slots.lock().await;
        slots.entry(key.to_owned()).or_default().clone()
    }

    /// Returns the account's message tab, creating or repairing it first if
    /// needed.
    ///
    /// Calling this twice in a row with a healthy incumbent yields the same
    /// tab. The per-account slot lock serializes concurrent callers and the
    /// health task for the same account; different accounts proceed
    /// independently.
    #[tracing::instrument(
        name = "custodian.ensure_message_tab",
        skip_all,
        fields(platform = %platform, account_id = account_id),
    )]
    pub async fn ensure_message_tab(
        self: &Arc<Self>,
        platform: &Platform,
        account_id: &str,
        cookie_file: &Utf8Path,
    ) -> Result<TabId, CoreError> {
        let key = account_key(platform, account_id);
        let slot = self.slot(&key).await;
        let mut guard = slot.lock().await;

        if let Some(record) = guard.record.clone() {
            match self.health_check(&record).await {
                Ok(()) => {
                    if let Some(record) = guard.record.as_mut() {
                        record.last_health_check_at = self.clock.now();
                    }
                    return Ok(record.tab_id);
                }
                Err(reason) => {
                    tracing::info!(%key, reason, "stale message tab, re-creating");
                    self.release_tab(&mut guard).await;
                }
            }
        }

        // Any previous monitor belongs to the tab we just released.
        if let Some(token) = guard.monitor.take() {
            token.cancel();
        }

        let record = self
            .create_record(platform, account_id, cookie_file, 0)
            .await?;
        let tab_id = record.tab_id.clone();
        guard.record = Some(record);
        guard.monitor = Some(self.spawn_monitor(key, slot.clone()));
        Ok(tab_id)
    }

    /// Retires an account's tab: stops the health task, then releases the
    /// tab. Idempotent; afterwards no mapping remains for the key.
    #[tracing::instrument(name = "custodian.cleanup", skip_all, fields(key))]
    pub async fn cleanup(&self, key: &str) {
        let slot = { self.slots.lock().await.remove(key) };
        let Some(slot) = slot else { return };
        let mut guard = slot.lock().await;
        // The monitor timer must stop before the tab goes away.
        if let Some(token) = guard.monitor.take() {
            token.cancel();
        }
        self.release_tab(&mut guard).await;
    }

    /// Retires every tab and stops every health task, then waits for the
    /// tasks to finish.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = { self.slots.lock().await.keys().cloned().collect() };
        for key in keys {
            self.cleanup(&key).await;
        }
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Snapshot of every live record.
    pub async fn records(&self) -> Vec<MessageTabRecord> {
        let slots: Vec<SharedSlot> = { self.slots.lock().await.values().cloned().collect() };
        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(record) = slot.lock().await.record.clone() {
                records.push(record);
            }
        }
        records
    }

    /// Snapshot of one account's record.
    pub async fn record(&self, key: &str) -> Option<MessageTabRecord> {
        let slot = { self.slots.lock().await.get(key).cloned() };
        match slot {
            Some(slot) => slot.lock().await.record.clone(),
            None => None,
        }
    }

    /// The health predicate: broker knows the tab, the message lock is held,
    /// the tab answers a trivial script within budget, and it has not been
    /// bounced to a login page.
    async fn health_check(&self, record: &MessageTabRecord) -> Result<(), &'static str> {
        if !self.broker.tab_exists(&record.tab_id).await {
            return Err("tab unknown to broker");
        }

        match self.broker.lock(&record.tab_id).await {
            Ok(Some(lock)) if lock.owner == LockOwner::Message => {}
            Ok(_) => return Err("message lock not held"),
            Err(_) => return Err("lock state unavailable"),
        }

        if self
            .broker
            .execute_script(&record.tab_id, "1 + 1", RESPONSIVENESS_TIMEOUT)
            .await
            .is_err()
        {
            return Err("tab unresponsive");
        }

        match self.broker.current_url(&record.tab_id).await {
            Ok(url) if url.contains("login") => Err("bounced to login page"),
            Ok(_) => Ok(()),
            Err(_) => Err("current url unavailable"),
        }
    }

    async fn release_tab(&self, guard: &mut Slot) {
        if let Some(record) = guard.record.take() {
            if let Err(e) = self.broker.close_tab(&record.tab_id).await {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    tab = %record.tab_id,
                    "tab close failed during release",
                );
            }
        }
    }

    async fn create_record(
        &self,
        platform: &Platform,
        account_id: &str,
        cookie_file: &Utf8Path,
        retry_count: u32,
    ) -> Result<MessageTabRecord, CoreError> {
        let plugin =
            self.registry
                .message(platform)
                .ok_or_else(|| CoreError::PluginUnavailable {
                    kind: tabfleet_data_model::PluginKind::Message,
                    platform: platform.clone(),
                })?;

        let tab_id = self
            .broker
            .create_tab(CreateTabParams {
                url: plugin.message_url(),
                owner: LockOwner::Message,
                headless: true,
                cookie_file: Some(cookie_file.to_owned()),
            })
            .await?;

        if let Some(script) = plugin.readiness_script() {
            if let Err(e) = self.wait_until_ready(&tab_id, &script).await {
                let _ = self.broker.close_tab(&tab_id).await;
                return Err(e);
            }
        }

        let now = self.clock.now();
        Ok(MessageTabRecord {
            tab_id,
            platform: platform.clone(),
            account_id: account_id.to_owned(),
            cookie_file: cookie_file.to_owned(),
            created_at: now,
            last_health_check_at: now,
            retry_count,
        })
    }

    async fn wait_until_ready(&self, tab: &TabId, script: &str) -> Result<(), CoreError> {
        let deadline = tokio::time::Instant::now() + READINESS_TIMEOUT;
        loop {
            match self
                .broker
                .execute_script(tab, script, RESPONSIVENESS_TIMEOUT)
                .await
            {
                Ok(value) if value.as_bool() == Some(true) => return Ok(()),
                Ok(_) => {
                    if tokio::time::Instant::now() + READINESS_POLL > deadline {
                        break;
                    }
                    tokio::time::sleep(READINESS_POLL).await;
                }
                Err(e) => {
                    tracing::trace!(
                        error = &e as &dyn std::error::Error,
                        "readiness probe raised, retrying",
                    );
                    if tokio::time::Instant::now() + READINESS_ERROR_RETRY > deadline {
                        break;
                    }
                    tokio::time::sleep(READINESS_ERROR_RETRY).await;
                }
            }
        }
        Err(CoreError::Timeout {
            phase: TimeoutPhase::Readiness,
            timeout: READINESS_TIMEOUT,
        })
    }

    fn spawn_monitor(self: &Arc<Self>, key: String, slot: SharedSlot) -> CancellationToken {
        let token = self.cancel.child_token();
        let task_token = token.clone();
        let custodian = self.clone();
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; the tab was just checked.
            interval.tick().await;
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = interval.tick() => {
                        if !custodian.health_tick(&key, &slot).await {
                            break;
                        }
                    }
                }
            }
        });
        token
    }

    /// One health-monitor pass. Returns whether the monitor should keep
    /// running.
    async fn health_tick(self: &Arc<Self>, key: &str, slot: &SharedSlot) -> bool {
        let mut guard = slot.lock().await;
        let Some(record) = guard.record.clone() else {
            return false;
        };

        match self.health_check(&record).await {
            Ok(()) => {
                if let Some(record) = guard.record.as_mut() {
                    record.retry_count = 0;
                    record.last_health_check_at = self.clock.now();
                }
                true
            }
            Err(reason) => {
                let retries = record.retry_count + 1;
                tracing::warn!(%key, reason, retries, "message tab failed health check");
                self.release_tab(&mut guard).await;

                if retries > MAX_REPAIRS {
                    // Give up; the scheduler will observe the missing tab on
                    // its next attempt and record the error there.
                    tracing::error!(%key, "message tab beyond repair, giving up");
                    guard.monitor = None;
                    return false;
                }

                tokio::time::sleep(REPAIR_COOLDOWN).await;
                match self
                    .create_record(
                        &record.platform,
                        &record.account_id,
                        &record.cookie_file,
                        retries,
                    )
                    .await
                {
                    Ok(new_record) => {
                        guard.record = Some(new_record);
                        true
                    }
                    Err(e) => {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            %key,
                            "message tab repair failed",
                        );
                        guard.monitor = None;
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use camino::Utf8Path;
    use tabfleet_data_model::Platform;
    use tabfleet_storage::SystemClock;
    use tokio_util::sync::CancellationToken;

    use super::MessageTabCustodian;
    use crate::{
        broker::BrokerError,
        error::CoreError,
        registry::PluginRegistry,
        testing::{FakeBroker, FakeMessagePlugin},
    };

    fn custodian_with(
        broker: Arc<FakeBroker>,
        plugin: FakeMessagePlugin,
    ) -> Arc<MessageTabCustodian> {
        let registry = Arc::new(
            PluginRegistry::builder()
                .message(Ok(Arc::new(plugin)))
                .build()
                .unwrap(),
        );
        MessageTabCustodian::new(
            broker,
            registry,
            Arc::new(SystemClock),
            CancellationToken::new(),
        )
    }

    fn wechat() -> Platform {
        Platform::new("wechat")
    }

    const COOKIE: &str = "/cookies/wechat_alice_1.json";

    #[tokio::test(start_paused = true)]
    async fn ensure_is_idempotent_with_a_healthy_incumbent() {
        let broker = Arc::new(FakeBroker::new());
        let custodian = custodian_with(broker.clone(), FakeMessagePlugin::new("wechat"));

        let first = custodian
            .ensure_message_tab(&wechat(), "alice", Utf8Path::new(COOKIE))
            .await
            .unwrap();
        let second = custodian
            .ensure_message_tab(&wechat(), "alice", Utf8Path::new(COOKIE))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(broker.created_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_dead_tab_is_replaced_on_ensure() {
        let broker = Arc::new(FakeBroker::new());
        let custodian = custodian_with(broker.clone(), FakeMessagePlugin::new("wechat"));

        let first = custodian
            .ensure_message_tab(&wechat(), "alice", Utf8Path::new(COOKIE))
            .await
            .unwrap();
        broker.kill_tab(&first);

        let second = custodian
            .ensure_message_tab(&wechat(), "alice", Utf8Path::new(COOKIE))
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(broker.open_tab_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_probe_never_passing_times_out_and_closes_the_tab() {
        let broker = Arc::new(FakeBroker::new());
        broker.set_script_handler(|_, script| {
            if script == "messageListReady()" {
                Ok(serde_json::Value::Bool(false))
            } else {
                Ok(serde_json::Value::Bool(true))
            }
        });
        let custodian = custodian_with(
            broker.clone(),
            FakeMessagePlugin::new("wechat").with_readiness("messageListReady()"),
        );

        let err = custodian
            .ensure_message_tab(&wechat(), "alice", Utf8Path::new(COOKIE))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert_eq!(broker.open_tab_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn an_unresponsive_tab_is_repaired_once_and_the_counter_resets() {
        let broker = Arc::new(FakeBroker::new());
        let custodian = custodian_with(broker.clone(), FakeMessagePlugin::new("wechat"));

        let first = custodian
            .ensure_message_tab(&wechat(), "alice", Utf8Path::new(COOKIE))
            .await
            .unwrap();
        broker.set_unresponsive(&first, true);

        // One health interval plus the repair cooldown.
        tokio::time::sleep(Duration::from_secs(70)).await;

        let record = custodian.record("wechat_alice").await.unwrap();
        assert_ne!(record.tab_id, first);
        assert_eq!(record.retry_count, 1);

        // The replacement is healthy; the next pass resets the counter.
        tokio::time::sleep(Duration::from_secs(60)).await;
        let record = custodian.record("wechat_alice").await.unwrap();
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_login_redirect_counts_as_unhealthy() {
        let broker = Arc::new(FakeBroker::new());
        let custodian = custodian_with(broker.clone(), FakeMessagePlugin::new("wechat"));

        let first = custodian
            .ensure_message_tab(&wechat(), "alice", Utf8Path::new(COOKIE))
            .await
            .unwrap();
        broker.set_tab_url(&first, "https://platform.example/login?next=messages");

        tokio::time::sleep(Duration::from_secs(70)).await;
        let record = custodian.record("wechat_alice").await.unwrap();
        assert_ne!(record.tab_id, first);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_exhaust_the_retry_budget_and_give_up() {
        let broker = Arc::new(FakeBroker::new());
        // Every tab is broken: the responsiveness probe always raises.
        broker.set_script_handler(|_, _| Err(BrokerError::Script("hung".to_owned())));
        let custodian = custodian_with(broker.clone(), FakeMessagePlugin::new("wechat"));

        custodian
            .ensure_message_tab(&wechat(), "alice", Utf8Path::new(COOKIE))
            .await
            .unwrap();

        // Four failing passes exceed the budget of three repairs.
        tokio::time::sleep(Duration::from_secs(6 * 70)).await;

        assert!(custodian.record("wechat_alice").await.is_none());
        assert_eq!(broker.open_tab_count(), 0);

        // A later ensure starts over from a fresh record.
        let tab = custodian
            .ensure_message_tab(&wechat(), "alice", Utf8Path::new(COOKIE))
            .await
            .unwrap();
        let record = custodian.record("wechat_alice").await.unwrap();
        assert_eq!(record.tab_id, tab);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_is_idempotent_and_leaves_no_mapping() {
        let broker = Arc::new(FakeBroker::new());
        let custodian = custodian_with(broker.clone(), FakeMessagePlugin::new("wechat"));

        custodian
            .ensure_message_tab(&wechat(), "alice", Utf8Path::new(COOKIE))
            .await
            .unwrap();
        custodian.cleanup("wechat_alice").await;
        custodian.cleanup("wechat_alice").await;

        assert!(custodian.record("wechat_alice").await.is_none());
        assert_eq!(broker.open_tab_count(), 0);
    }
}
