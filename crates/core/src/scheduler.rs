// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The sync scheduler.
//!
//! Owns the task set, a 30 s master tick and one deferred timer per task.
//! Backoff state lives on the task itself (`consecutive_errors`); arming the
//! next run simply consults that field. A task never overlaps itself, the
//! scheduler never runs more than `max_concurrent_tasks` syncs at once, and
//! a task failing `max_consecutive_errors` times in a row is quarantined
//! until its cookie is rotated.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, LazyLock, Mutex, MutexGuard},
    time::Duration,
};

use camino::{Utf8Path, Utf8PathBuf};
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use opentelemetry::{
    metrics::{Counter, Meter},
    KeyValue,
};
use tabfleet_data_model::{account_key, Platform, SyncReport, SyncTask, TabId, TaskStatus};
use tabfleet_storage::{BoxClock, Clock as _};
use tokio::task::AbortHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use ulid::Ulid;

use crate::{custodian::MessageTabCustodian, error::CoreError, sync::SyncOptions};

static METER: LazyLock<Meter> = LazyLock::new(|| {
    let scope = opentelemetry::InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .build();

    opentelemetry::global::meter_with_scope(scope)
});

/// The sync execution a scheduler delegates to.
///
/// Injected at construction; the server wires this to the sync engine.
pub type SyncFn = Arc<
    dyn Fn(Platform, String, TabId, SyncOptions) -> BoxFuture<'static, Result<SyncReport, CoreError>>
        + Send
        + Sync,
>;

/// Tunables of the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cadence of the master tick that catches timer-less ready tasks.
    pub master_tick: Duration,
    /// Syncs allowed in flight at once.
    pub max_concurrent_tasks: usize,
    /// How long a gated execution is deferred.
    pub defer_delay: Duration,
    /// Base of the per-error exponential backoff.
    pub backoff_multiplier: f64,
    /// Consecutive failures after which a task is quarantined.
    pub max_consecutive_errors: u32,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Interval assigned to tasks registered without one.
    pub default_interval_minutes: u32,
    /// How long `stop` waits for in-flight syncs.
    pub drain_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            master_tick: Duration::from_secs(30),
            max_concurrent_tasks: 5,
            defer_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_consecutive_errors: 3,
            max_delay: Duration::from_secs(30 * 60),
            default_interval_minutes: 5,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Aggregate scheduler state for status queries.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    /// Whether the scheduler is started.
    pub is_running: bool,
    /// Tasks in the set.
    pub total_tasks: usize,
    /// Tasks eligible for scheduling.
    pub enabled_tasks: usize,
    /// Syncs in flight.
    pub running_tasks: usize,
    /// Quarantined tasks.
    pub quarantined_tasks: usize,
}

struct Inner {
    tasks: IndexMap<Ulid, SyncTask>,
    by_key: HashMap<String, Ulid>,
    timers: HashMap<Ulid, AbortHandle>,
    running: HashSet<Ulid>,
    is_running: bool,
    master: Option<CancellationToken>,
}

struct Metrics {
    executions: Counter<u64>,
    failures: Counter<u64>,
    quarantines: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        Self {
            executions: METER
                .u64_counter("tabfleet.sync.executions")
                .with_description("Sync executions dispatched by the scheduler")
                .build(),
            failures: METER
                .u64_counter("tabfleet.sync.failures")
                .with_description("Sync executions that failed")
                .build(),
            quarantines: METER
                .u64_counter("tabfleet.sync.quarantines")
                .with_description("Tasks quarantined after repeated failures")
                .build(),
        }
    }
}

/// Periodic, concurrency-bounded, backoff-aware execution of message-sync
/// tasks.
pub struct SyncScheduler {
    config: SchedulerConfig,
    custodian: Arc<MessageTabCustodian>,
    sync_fn: SyncFn,
    clock: BoxClock,
    inner: Mutex<Inner>,
    tracker: TaskTracker,
    metrics: Metrics,
}

fn compute_delay(config: &SchedulerConfig, task: &SyncTask) -> Duration {
    let base = f64::from(task.sync_interval_minutes) * 60.0;
    let factor = config
        .backoff_multiplier
        .powi(i32::try_from(task.consecutive_errors).unwrap_or(i32::MAX));
    let delay = Duration::from_secs_f64((base * factor).max(0.0));
    delay.min(config.max_delay)
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(30 * 60))
}

impl SyncScheduler {
    /// Creates the scheduler. It stays idle until [`Self::start`].
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        custodian: Arc<MessageTabCustodian>,
        sync_fn: SyncFn,
        clock: BoxClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            custodian,
            sync_fn,
            clock,
            inner: Mutex::new(Inner {
                tasks: IndexMap::new(),
                by_key: HashMap::new(),
                timers: HashMap::new(),
                running: HashSet::new(),
                is_running: false,
                master: None,
            }),
            tracker: TaskTracker::new(),
            metrics: Metrics::new(),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("scheduler state poisoned")
    }

    /// Arms the master tick and schedules every enabled task.
    pub fn start(self: &Arc<Self>) {
        let ids: Vec<Ulid> = {
            let mut inner = self.inner();
            if inner.is_running {
                return;
            }
            inner.is_running = true;
            let token = CancellationToken::new();
            inner.master = Some(token.clone());
            self.spawn_master(token);
            inner
                .tasks
                .values()
                .filter(|t| t.enabled)
                .map(|t| t.id)
                .collect()
        };
        let count = ids.len();
        for id in ids {
            let delay = {
                let inner = self.inner();
                inner.tasks.get(&id).map(|t| compute_delay(&self.config, t))
            };
            if let Some(delay) = delay {
                self.schedule(id, delay);
            }
        }
        tracing::info!(tasks = count, "sync scheduler started");
    }

    /// Stops scheduling and waits up to the drain timeout for in-flight
    /// syncs to finish.
    pub async fn stop(self: &Arc<Self>) {
        {
            let mut inner = self.inner();
            if !inner.is_running {
                return;
            }
            inner.is_running = false;
            if let Some(master) = inner.master.take() {
                master.cancel();
            }
            for (_, handle) in inner.timers.drain() {
                handle.abort();
            }
            for task in inner.tasks.values_mut() {
                if task.status == TaskStatus::Pending || task.status == TaskStatus::Running {
                    task.status = TaskStatus::Stopped;
                }
                task.next_sync_at = None;
            }
        }

        self.tracker.close();
        if tokio::time::timeout(self.config.drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("sync scheduler drain timed out with tasks still in flight");
        }
        tracing::info!("sync scheduler stopped");
    }

    /// Registers a task for an account.
    ///
    /// `(platform, account_id)` is unique across the task set.
    pub fn add_task(
        self: &Arc<Self>,
        platform: Platform,
        account_id: String,
        cookie_file: Utf8PathBuf,
        sync_interval_minutes: Option<u32>,
        priority: Option<u8>,
    ) -> Result<SyncTask, CoreError> {
        let key = account_key(&platform, &account_id);
        let (task, arm) = {
            let mut inner = self.inner();
            if inner.by_key.contains_key(&key) {
                return Err(CoreError::validation(format!(
                    "a sync task already exists for {key}"
                )));
            }
            let task = SyncTask::new(
                platform,
                account_id,
                cookie_file,
                sync_interval_minutes.unwrap_or(self.config.default_interval_minutes),
                priority.unwrap_or(5).clamp(1, 10),
                self.clock.now(),
            );
            inner.by_key.insert(key, task.id);
            inner.tasks.insert(task.id, task.clone());
            (task.clone(), inner.is_running)
        };
        if arm {
            self.schedule(task.id, compute_delay(&self.config, &task));
        }
        tracing::info!(task.id = %task.id, key = %task.account_key(), "sync task added");
        Ok(task)
    }

    /// Removes a task and cancels its timer.
    pub fn remove_task(&self, id: Ulid) -> Result<SyncTask, CoreError> {
        let mut inner = self.inner();
        let task = inner
            .tasks
            .shift_remove(&id)
            .ok_or(CoreError::NotFound { entity: "task" })?;
        inner.by_key.remove(&task.account_key());
        if let Some(handle) = inner.timers.remove(&id) {
            handle.abort();
        }
        tracing::info!(task.id = %id, "sync task removed");
        Ok(task)
    }

    /// Rotates a task's cookie bundle, lifting any quarantine.
    pub fn update_task_cookie(
        self: &Arc<Self>,
        key: &str,
        new_cookie_file: &Utf8Path,
        reason: &str,
    ) -> Result<SyncTask, CoreError> {
        let task = {
            let mut inner = self.inner();
            let id = *inner
                .by_key
                .get(key)
                .ok_or(CoreError::NotFound { entity: "task" })?;
            let now = self.clock.now();
            let task = inner
                .tasks
                .get_mut(&id)
                .ok_or(CoreError::NotFound { entity: "task" })?;
            task.current_cookie_file = new_cookie_file.to_owned();
            task.last_cookie_update = Some(now);
            task.cookie_update_count += 1;
            task.consecutive_errors = 0;
            task.last_error = None;
            task.enabled = true;
            if task.status == TaskStatus::Error || task.status == TaskStatus::Stopped {
                task.status = TaskStatus::Pending;
            }
            task.clone()
        };
        tracing::info!(key, reason, "task cookie rotated");
        self.schedule(task.id, compute_delay(&self.config, &task));
        Ok(task)
    }

    /// Compatibility entry point: registers the account if unknown,
    /// otherwise rotates its cookie. The passed-in cookie path is
    /// authoritative either way.
    pub fn start_for_account(
        self: &Arc<Self>,
        platform: Platform,
        account_id: String,
        cookie_file: Utf8PathBuf,
        sync_interval_minutes: Option<u32>,
    ) -> Result<SyncTask, CoreError> {
        let key = account_key(&platform, &account_id);
        let exists = { self.inner().by_key.contains_key(&key) };
        if exists {
            self.update_task_cookie(&key, &cookie_file, "scheduler re-registration")
        } else {
            self.add_task(platform, account_id, cookie_file, sync_interval_minutes, None)
        }
    }

    /// Snapshot of every task.
    #[must_use]
    pub fn tasks(&self) -> Vec<SyncTask> {
        self.inner().tasks.values().cloned().collect()
    }

    /// Snapshot of one task.
    #[must_use]
    pub fn task(&self, id: Ulid) -> Option<SyncTask> {
        self.inner().tasks.get(&id).cloned()
    }

    /// Snapshot of one task by account key.
    #[must_use]
    pub fn task_by_key(&self, key: &str) -> Option<SyncTask> {
        let inner = self.inner();
        let id = inner.by_key.get(key)?;
        inner.tasks.get(id).cloned()
    }

    /// Aggregate status.
    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        let inner = self.inner();
        SchedulerStatus {
            is_running: inner.is_running,
            total_tasks: inner.tasks.len(),
            enabled_tasks: inner.tasks.values().filter(|t| t.enabled).count(),
            running_tasks: inner.running.len(),
            quarantined_tasks: inner
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Error)
                .count(),
        }
    }

    /// Arms (or re-arms) the task's deferred timer. Only one timer per task
    /// exists at a time.
    fn schedule(self: &Arc<Self>, id: Ulid, delay: Duration) {
        let mut inner = self.inner();
        if !inner.is_running {
            return;
        }
        let now = self.clock.now();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return;
        };
        if !task.enabled {
            return;
        }
        task.next_sync_at = Some(now + to_chrono(delay));

        if let Some(previous) = inner.timers.remove(&id) {
            previous.abort();
        }
        let scheduler = self.clone();
        let handle = self.tracker.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = scheduler.inner();
                inner.timers.remove(&id);
            }
            scheduler.execute(id).await;
        });
        inner.timers.insert(id, handle.abort_handle());
    }

    fn spawn_master(self: &Arc<Self>, token: CancellationToken) {
        let scheduler = self.clone();
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config.master_tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => scheduler.master_tick(),
                }
            }
        });
    }

    /// Dispatches every ready task that lost its timer, in task-map
    /// iteration order. Priority is deliberately not consulted here.
    fn master_tick(self: &Arc<Self>) {
        let now = self.clock.now();
        let ready: Vec<Ulid> = {
            let inner = self.inner();
            if !inner.is_running {
                return;
            }
            inner
                .tasks
                .values()
                .filter(|t| {
                    t.enabled
                        && t.status == TaskStatus::Pending
                        && !inner.running.contains(&t.id)
                        && !inner.timers.contains_key(&t.id)
                        && t.next_sync_at.is_none_or(|due| due <= now)
                })
                .map(|t| t.id)
                .collect()
        };
        for id in ready {
            let scheduler = self.clone();
            self.tracker.spawn(async move {
                scheduler.execute(id).await;
            });
        }
    }

    /// Runs one sync execution for the task.
    async fn execute(self: &Arc<Self>, id: Ulid) {
        let (platform, account_id, cookie_file) = {
            let mut inner = self.inner();
            if !inner.is_running {
                return;
            }
            let Some(task) = inner.tasks.get(&id) else {
                return;
            };
            if !task.enabled || task.status == TaskStatus::Running {
                return;
            }
            if inner.running.len() >= self.config.max_concurrent_tasks {
                drop(inner);
                tracing::debug!(task.id = %id, "concurrency gate full, deferring");
                self.schedule(id, self.config.defer_delay);
                return;
            }
            inner.running.insert(id);
            let task = inner
                .tasks
                .get_mut(&id)
                .expect("task existence checked above");
            task.status = TaskStatus::Running;
            (
                task.platform.clone(),
                task.account_id.clone(),
                task.current_cookie_file.clone(),
            )
        };

        self.metrics
            .executions
            .add(1, &[KeyValue::new("platform", platform.to_string())]);
        let started = tokio::time::Instant::now();

        let result = async {
            let tab_id = self
                .custodian
                .ensure_message_tab(&platform, &account_id, &cookie_file)
                .await?;
            (self.sync_fn)(
                platform.clone(),
                account_id.clone(),
                tab_id,
                SyncOptions { full_sync: false },
            )
            .await
        }
        .await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let now = self.clock.now();

        let next_delay = {
            let mut inner = self.inner();
            inner.running.remove(&id);
            let is_running = inner.is_running;
            let Some(task) = inner.tasks.get_mut(&id) else {
                // Removed while running; nothing left to update.
                return;
            };

            match result {
                Ok(report) => {
                    task.consecutive_errors = 0;
                    task.last_error = None;
                    task.sync_count += 1;
                    task.avg_sync_duration_ms +=
                        (elapsed_ms - task.avg_sync_duration_ms) / task.sync_count as f64;
                    task.new_messages_last_sync = report.new_messages;
                    task.total_messages += report.new_messages;
                    task.last_sync_at = Some(now);
                    task.status = TaskStatus::Pending;
                    tracing::debug!(
                        task.id = %id,
                        new_messages = report.new_messages,
                        "sync execution succeeded",
                    );
                }
                Err(e) => {
                    task.error_count += 1;
                    task.consecutive_errors += 1;
                    task.last_error = Some(e.to_string());
                    self.metrics
                        .failures
                        .add(1, &[KeyValue::new("platform", platform.to_string())]);

                    if task.consecutive_errors >= self.config.max_consecutive_errors {
                        task.status = TaskStatus::Error;
                        task.enabled = false;
                        task.next_sync_at = None;
                        self.metrics
                            .quarantines
                            .add(1, &[KeyValue::new("platform", platform.to_string())]);
                        tracing::warn!(
                            task.id = %id,
                            consecutive_errors = task.consecutive_errors,
                            error = &e as &dyn std::error::Error,
                            "task quarantined after repeated failures",
                        );
                    } else {
                        task.status = TaskStatus::Pending;
                        tracing::debug!(
                            task.id = %id,
                            consecutive_errors = task.consecutive_errors,
                            error = &e as &dyn std::error::Error,
                            "sync execution failed",
                        );
                    }
                }
            }

            if task.enabled && is_running {
                Some(compute_delay(&self.config, task))
            } else {
                None
            }
        };

        if let Some(delay) = next_delay {
            self.schedule(id, delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    use camino::Utf8PathBuf;
    use chrono::Utc;
    use tabfleet_data_model::{Platform, SyncReport, TaskStatus};
    use tabfleet_storage::SystemClock;
    use tokio_util::sync::CancellationToken;

    use super::{SchedulerConfig, SyncFn, SyncScheduler};
    use crate::{
        custodian::MessageTabCustodian,
        registry::PluginRegistry,
        testing::{FakeBroker, FakeMessagePlugin},
    };

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            default_interval_minutes: 1,
            ..SchedulerConfig::default()
        }
    }

    fn scheduler_with(sync_fn: SyncFn) -> Arc<SyncScheduler> {
        let broker = Arc::new(FakeBroker::new());
        let registry = Arc::new(
            PluginRegistry::builder()
                .message(Ok(Arc::new(FakeMessagePlugin::new("wechat"))))
                .build()
                .unwrap(),
        );
        let clock = Arc::new(SystemClock);
        let custodian =
            MessageTabCustodian::new(broker, registry, clock.clone(), CancellationToken::new());
        SyncScheduler::new(test_config(), custodian, sync_fn, clock)
    }

    fn failing_sync(calls: Arc<AtomicU64>) -> SyncFn {
        Arc::new(move |_, _, _, _| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::CoreError::Transient(anyhow::anyhow!(
                    "simulated sync failure"
                )))
            })
        })
    }

    fn ok_report() -> SyncReport {
        SyncReport {
            threads: 1,
            new_messages: 2,
            updated_threads: 1,
            errors: Vec::new(),
            sync_time: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn three_consecutive_failures_quarantine_the_task() {
        let calls = Arc::new(AtomicU64::new(0));
        let scheduler = scheduler_with(failing_sync(calls.clone()));
        let task = scheduler
            .add_task(
                Platform::new("wechat"),
                "alice".to_owned(),
                Utf8PathBuf::from("/cookies/wechat_alice_1.json"),
                Some(1),
                None,
            )
            .unwrap();
        scheduler.start();

        // Failures at +1 min, then backoff 2 min, then 4 min.
        tokio::time::sleep(Duration::from_secs(8 * 60)).await;

        let task = scheduler.task(task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert!(!task.enabled);
        assert_eq!(task.consecutive_errors, 3);
        assert_eq!(task.error_count, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Quarantined: no further timer fires.
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cookie_rotation_recovers_a_quarantined_task() {
        let calls = Arc::new(AtomicU64::new(0));
        let fail = Arc::new(AtomicBool::new(true));
        let sync_fn: SyncFn = {
            let calls = calls.clone();
            let fail = fail.clone();
            Arc::new(move |_, _, _, _| {
                let calls = calls.clone();
                let fail = fail.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if fail.load(Ordering::SeqCst) {
                        Err(crate::error::CoreError::Transient(anyhow::anyhow!(
                            "cookie expired"
                        )))
                    } else {
                        Ok(ok_report())
                    }
                })
            })
        };
        let scheduler = scheduler_with(sync_fn);
        let task = scheduler
            .add_task(
                Platform::new("wechat"),
                "alice".to_owned(),
                Utf8PathBuf::from("/cookies/wechat_alice_1.json"),
                Some(1),
                None,
            )
            .unwrap();
        let key = task.account_key();
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(8 * 60)).await;
        assert_eq!(scheduler.task(task.id).unwrap().status, TaskStatus::Error);

        fail.store(false, Ordering::SeqCst);
        let rotated = scheduler
            .update_task_cookie(
                &key,
                camino::Utf8Path::new("/cookies/wechat_alice_2.json"),
                "relogin",
            )
            .unwrap();
        assert_eq!(rotated.status, TaskStatus::Pending);
        assert!(rotated.enabled);
        assert_eq!(rotated.consecutive_errors, 0);
        assert_eq!(rotated.last_error, None);
        assert_eq!(rotated.cookie_update_count, 2);

        // The re-armed timer runs the task with the fresh cookie.
        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        let task = scheduler.task(task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.sync_count, 1);
        assert_eq!(
            task.current_cookie_file,
            Utf8PathBuf::from("/cookies/wechat_alice_2.json")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_task_never_overlaps_itself() {
        let live = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let sync_fn: SyncFn = {
            let live = live.clone();
            let max_seen = max_seen.clone();
            Arc::new(move |_, _, _, _| {
                let live = live.clone();
                let max_seen = max_seen.clone();
                Box::pin(async move {
                    let current = live.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(current, Ordering::SeqCst);
                    // Far longer than the sync interval.
                    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                    Ok(ok_report())
                })
            })
        };
        let scheduler = scheduler_with(sync_fn);
        scheduler
            .add_task(
                Platform::new("wechat"),
                "alice".to_owned(),
                Utf8PathBuf::from("/cookies/wechat_alice_1.json"),
                Some(1),
                None,
            )
            .unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_by_the_gate() {
        let live = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let sync_fn: SyncFn = {
            let live = live.clone();
            let max_seen = max_seen.clone();
            Arc::new(move |_, _, _, _| {
                let live = live.clone();
                let max_seen = max_seen.clone();
                Box::pin(async move {
                    let current = live.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(90)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                    Ok(ok_report())
                })
            })
        };
        let scheduler = scheduler_with(sync_fn);
        for i in 0..8 {
            scheduler
                .add_task(
                    Platform::new("wechat"),
                    format!("account-{i}"),
                    Utf8PathBuf::from(format!("/cookies/wechat_account-{i}_1.json")),
                    Some(1),
                    None,
                )
                .unwrap();
        }
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(20 * 60)).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 5);
        // Every task still got to run.
        for task in scheduler.tasks() {
            assert!(task.sync_count > 0, "task {} never ran", task.account_key());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn add_then_remove_leaves_no_task_and_no_timer() {
        let calls = Arc::new(AtomicU64::new(0));
        let scheduler = scheduler_with(failing_sync(calls.clone()));
        scheduler.start();

        let before = scheduler.tasks().len();
        let task = scheduler
            .add_task(
                Platform::new("wechat"),
                "alice".to_owned(),
                Utf8PathBuf::from("/cookies/wechat_alice_1.json"),
                Some(1),
                None,
            )
            .unwrap();
        scheduler.remove_task(task.id).unwrap();
        assert_eq!(scheduler.tasks().len(), before);

        // The timer armed by add_task is gone with the task.
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn average_duration_is_an_incremental_mean() {
        let sync_fn: SyncFn = Arc::new(move |_, _, _, _| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(ok_report())
            })
        });
        let scheduler = scheduler_with(sync_fn);
        let task = scheduler
            .add_task(
                Platform::new("wechat"),
                "alice".to_owned(),
                Utf8PathBuf::from("/cookies/wechat_alice_1.json"),
                Some(1),
                None,
            )
            .unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(3 * 60)).await;
        let task = scheduler.task(task.id).unwrap();
        assert!(task.sync_count >= 2);
        assert!((task.avg_sync_duration_ms - 10_000.0).abs() < 1.0);
        assert_eq!(task.total_messages, task.sync_count * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_and_marks_tasks_stopped() {
        let sync_fn: SyncFn = Arc::new(move |_, _, _, _| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ok_report())
            })
        });
        let scheduler = scheduler_with(sync_fn);
        let task = scheduler
            .add_task(
                Platform::new("wechat"),
                "alice".to_owned(),
                Utf8PathBuf::from("/cookies/wechat_alice_1.json"),
                Some(1),
                None,
            )
            .unwrap();
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(70)).await;

        scheduler.stop().await;
        let task = scheduler.task(task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Stopped);
        assert!(!scheduler.status().is_running);
    }
}
