// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::Platform;

/// The triple that identifies one platform account to the core.
///
/// The cookie file path is an opaque handle consumed by the platform plugin;
/// the core never parses it. While any active task references the account,
/// the path is considered valid; rotation is an explicit update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRef {
    /// The platform the account lives on.
    pub platform: Platform,
    /// The platform-side account identifier.
    pub account_id: String,
    /// Opaque path to the persisted session-cookie bundle.
    pub cookie_file: Utf8PathBuf,
}

impl AccountRef {
    /// The canonical identity of the account: `"{platform}_{accountId}"`.
    #[must_use]
    pub fn key(&self) -> String {
        account_key(&self.platform, &self.account_id)
    }
}

/// Builds the canonical account key for a `(platform, account_id)` pair.
#[must_use]
pub fn account_key(platform: &Platform, account_id: &str) -> String {
    format!("{platform}_{account_id}")
}

/// Validation state of a stored account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// The cookie bundle was accepted on the last check.
    Valid,
    /// The cookie bundle was rejected on the last check.
    Invalid,
    /// Never checked.
    Unknown,
}

/// A persisted account row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Store-assigned identifier.
    pub id: Ulid,
    /// The platform the account lives on.
    pub platform: Platform,
    /// Platform-side account identifier.
    pub account_id: String,
    /// Display name of the account.
    pub user_name: String,
    /// Opaque path to the session-cookie bundle.
    pub cookie_file: Utf8PathBuf,
    /// Validation state.
    pub status: AccountStatus,
    /// When the cookie bundle was last validated.
    pub last_check_time: Option<DateTime<Utc>>,
    /// Optional operator-assigned group.
    pub group_id: Option<Ulid>,
    /// Whether the account is a candidate for message monitoring.
    pub can_monitor: bool,
}

impl Account {
    /// The account reference used by the orchestration core.
    #[must_use]
    pub fn to_ref(&self) -> AccountRef {
        AccountRef {
            platform: self.platform.clone(),
            account_id: self.account_id.clone(),
            cookie_file: self.cookie_file.clone(),
        }
    }

    /// The canonical account key.
    #[must_use]
    pub fn key(&self) -> String {
        account_key(&self.platform, &self.account_id)
    }
}

/// Profile details a platform reports for a logged-in account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    /// Platform-side account identifier, when the platform exposes one.
    pub account_id: Option<String>,
    /// Display name.
    pub nickname: Option<String>,
    /// Avatar image URL.
    pub avatar_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::AccountRef;
    use crate::Platform;

    #[test]
    fn account_key_joins_platform_and_id() {
        let account = AccountRef {
            platform: Platform::new("wechat"),
            account_id: "alice".to_owned(),
            cookie_file: Utf8PathBuf::from("/cookies/wechat_alice_1.json"),
        };
        assert_eq!(account.key(), "wechat_alice");
    }
}
