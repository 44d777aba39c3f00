// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use std::fmt;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Platform;

/// Opaque identifier of one browser tab, issued by the tab broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(String);

impl TabId {
    /// Wraps a broker-issued identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The component holding a tab's lock.
///
/// The lock is the sole concurrency-control primitive between components
/// over a tab: a tab is usable only by the component holding its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOwner {
    /// Held for the duration of one upload job.
    Upload,
    /// Held while a QR login is pending.
    Login,
    /// Held by the message-tab custodian for a monitored account.
    Message,
    /// Held briefly while a cookie bundle is checked.
    Validate,
}

impl LockOwner {
    /// The lowercase tag used on the bridge wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Login => "login",
            Self::Message => "message",
            Self::Validate => "validate",
        }
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A held tab lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabLock {
    /// The holding component.
    pub owner: LockOwner,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

/// Metadata of one long-lived message tab.
///
/// Owned exclusively by the message-tab custodian; only it may mutate a
/// record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageTabRecord {
    /// The broker-issued tab.
    pub tab_id: TabId,
    /// Platform the tab is logged in to.
    pub platform: Platform,
    /// Account the tab belongs to.
    pub account_id: String,
    /// Cookie bundle the tab was created with.
    pub cookie_file: Utf8PathBuf,
    /// When the tab was allocated.
    pub created_at: DateTime<Utc>,
    /// When the health monitor last evaluated the tab.
    pub last_health_check_at: DateTime<Utc>,
    /// Consecutive failed health checks since the last healthy one.
    pub retry_count: u32,
}
