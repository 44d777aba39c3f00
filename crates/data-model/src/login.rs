// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AccountInfo, Platform, TabId};

/// State of one QR login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStatus {
    /// Waiting for the user to scan the QR code.
    Pending,
    /// The scan completed and a cookie bundle was captured.
    Completed,
    /// The login failed or timed out.
    Failed,
    /// Cancelled by the operator.
    Cancelled,
}

impl LoginStatus {
    /// Whether the record will never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One login attempt, keyed by `user_id`.
///
/// Created by `start_login`, mutated by the background processor, reaped by
/// the janitor 24 h after reaching a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRecord {
    /// The operator-chosen identity the login is for.
    pub user_id: String,
    /// Platform being logged in to.
    pub platform: Platform,
    /// Current state.
    pub status: LoginStatus,
    /// When the login was started.
    pub started_at: DateTime<Utc>,
    /// When a terminal state was reached.
    pub ended_at: Option<DateTime<Utc>>,
    /// The tab hosting the QR code while pending.
    pub tab_id: Option<TabId>,
    /// The QR code image URL shown to the user.
    pub qr_code_url: Option<String>,
    /// The captured cookie bundle, on completion.
    pub cookie_file: Option<Utf8PathBuf>,
    /// Profile details reported by the platform, on completion.
    pub account_info: Option<AccountInfo>,
}

impl LoginRecord {
    /// Creates a pending record.
    #[must_use]
    pub fn pending(platform: Platform, user_id: String, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            platform,
            status: LoginStatus::Pending,
            started_at: now,
            ended_at: None,
            tab_id: None,
            qr_code_url: None,
            cookie_file: None,
            account_info: None,
        }
    }

    /// The moment the janitor measures record age from.
    #[must_use]
    pub fn reaping_reference(&self) -> DateTime<Utc> {
        self.ended_at.unwrap_or(self.started_at)
    }
}
