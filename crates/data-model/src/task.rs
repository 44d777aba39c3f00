// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{account::account_key, Platform};

/// Lifecycle state of a scheduler task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its next run.
    Pending,
    /// A sync execution is in flight.
    Running,
    /// Paused by the operator.
    Paused,
    /// Quarantined after repeated failures; requires explicit re-enable.
    Error,
    /// Stopped together with the scheduler.
    Stopped,
}

/// One periodic message-sync task.
///
/// Keyed by `id`; `(platform, account_id)` is unique across the task set.
/// All counters are monotonic; backoff state lives on the task itself
/// (`consecutive_errors`) rather than on a timer heap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
    /// Task identifier.
    pub id: Ulid,
    /// Platform of the synced account.
    pub platform: Platform,
    /// Account being synced.
    pub account_id: String,
    /// Cookie bundle used for the next execution.
    pub current_cookie_file: Utf8PathBuf,
    /// When the cookie bundle was last replaced.
    pub last_cookie_update: Option<DateTime<Utc>>,
    /// How many cookie bundles this task has seen, the initial one included.
    pub cookie_update_count: u64,
    /// Base sync interval.
    pub sync_interval_minutes: u32,
    /// Whether the task is eligible for scheduling.
    pub enabled: bool,
    /// Operator display priority, 1–10. Not consulted for dispatch order.
    pub priority: u8,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Completion time of the last execution.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Due time of the next execution.
    pub next_sync_at: Option<DateTime<Utc>>,
    /// Successful executions.
    pub sync_count: u64,
    /// Failed executions.
    pub error_count: u64,
    /// Failures since the last success; drives exponential backoff.
    pub consecutive_errors: u32,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Messages pulled over the task's lifetime.
    pub total_messages: u64,
    /// Messages pulled by the most recent successful execution.
    pub new_messages_last_sync: u64,
    /// Incremental mean duration of successful executions.
    pub avg_sync_duration_ms: f64,
}

impl SyncTask {
    /// Creates a task in its initial state.
    ///
    /// The initial cookie bundle counts as the first cookie update.
    #[must_use]
    pub fn new(
        platform: Platform,
        account_id: String,
        cookie_file: Utf8PathBuf,
        sync_interval_minutes: u32,
        priority: u8,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            platform,
            account_id,
            current_cookie_file: cookie_file,
            last_cookie_update: Some(now),
            cookie_update_count: 1,
            sync_interval_minutes,
            enabled: true,
            priority,
            status: TaskStatus::Pending,
            last_sync_at: None,
            next_sync_at: None,
            sync_count: 0,
            error_count: 0,
            consecutive_errors: 0,
            last_error: None,
            total_messages: 0,
            new_messages_last_sync: 0,
            avg_sync_duration_ms: 0.0,
        }
    }

    /// The canonical account key of the synced account.
    #[must_use]
    pub fn account_key(&self) -> String {
        account_key(&self.platform, &self.account_id)
    }
}
