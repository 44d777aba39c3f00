// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::Platform;

/// Kind of a direct message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text.
    Text,
    /// An image, carried as a URL.
    Image,
}

/// Direction of a direct message relative to the monitored account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    /// Sent by the conversation peer.
    Inbound,
    /// Sent by the monitored account.
    Outbound,
}

/// A persisted conversation thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageThread {
    /// Store-assigned identifier.
    pub id: Ulid,
    /// Platform the thread lives on.
    pub platform: Platform,
    /// The monitored account owning the thread.
    pub account_id: String,
    /// Platform-side identifier of the conversation peer.
    pub peer_id: String,
    /// Display name of the peer.
    pub peer_name: String,
    /// Avatar URL of the peer.
    pub peer_avatar: Option<String>,
    /// Unread inbound messages.
    pub unread_count: u64,
    /// Timestamp of the newest message.
    pub last_message_at: Option<DateTime<Utc>>,
    /// When the thread was last touched by a sync.
    pub updated_at: DateTime<Utc>,
}

/// A persisted direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Store-assigned identifier.
    pub id: Ulid,
    /// The thread the message belongs to.
    pub thread_id: Ulid,
    /// Platform-side message identifier, used for deduplication.
    pub platform_message_id: String,
    /// Direction relative to the monitored account.
    pub direction: MessageDirection,
    /// Payload kind.
    pub kind: MessageKind,
    /// Text content, or the image URL for image messages.
    pub content: String,
    /// When the message was sent.
    pub sent_at: DateTime<Utc>,
    /// Whether the operator has read the message.
    pub read: bool,
}

/// A message as reported by a platform plugin, before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedMessage {
    /// Platform-side message identifier.
    pub platform_message_id: String,
    /// Direction relative to the monitored account.
    pub direction: MessageDirection,
    /// Payload kind.
    pub kind: MessageKind,
    /// Text content, or the image URL for image messages.
    pub content: String,
    /// When the message was sent.
    pub sent_at: DateTime<Utc>,
}

/// A thread as reported by a platform plugin, before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedThread {
    /// Platform-side identifier of the conversation peer.
    pub peer_id: String,
    /// Display name of the peer.
    pub peer_name: String,
    /// Avatar URL of the peer.
    pub peer_avatar: Option<String>,
    /// Messages visible in the inbox for this peer.
    pub messages: Vec<SyncedMessage>,
}

/// Outcome of one account sync after persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Threads seen by the sync.
    pub threads: u64,
    /// Messages that were new to the store.
    pub new_messages: u64,
    /// Threads whose content changed.
    pub updated_threads: u64,
    /// Non-fatal errors reported by the plugin.
    pub errors: Vec<String>,
    /// When the sync ran.
    pub sync_time: DateTime<Utc>,
}

/// Outcome of sending one direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReport {
    /// Whether the platform accepted the message.
    pub success: bool,
    /// Platform-side identifier of the sent message, when reported.
    pub message_id: Option<String>,
    /// Failure detail.
    pub error: Option<String>,
}

/// Per-platform slice of the message statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformMessageStats {
    /// The platform.
    pub platform: Platform,
    /// Threads on the platform.
    pub threads: u64,
    /// Messages on the platform.
    pub messages: u64,
    /// Unread inbound messages on the platform.
    pub unread: u64,
}

/// Aggregate message-store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatistics {
    /// Threads across all platforms.
    pub total_threads: u64,
    /// Messages across all platforms.
    pub total_messages: u64,
    /// Unread inbound messages across all platforms.
    pub unread_messages: u64,
    /// Per-platform breakdown.
    pub by_platform: Vec<PlatformMessageStats>,
}

/// Why a monitoring start was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorDenyReason {
    /// The cookie bundle was rejected by the platform.
    ValidationFailed,
    /// A listener is already installed for the account.
    AlreadyMonitoring,
    /// The listener script could not be injected.
    ScriptInjectionFailed,
}

impl MonitorDenyReason {
    /// The stable user-facing message for this reason.
    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "账号已失效，请重新登录",
            Self::AlreadyMonitoring => "账号已在监听中",
            Self::ScriptInjectionFailed => "监听脚本启动失败，请重试",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MonitorDenyReason;

    #[test]
    fn deny_reasons_map_to_fixed_messages() {
        assert_eq!(
            MonitorDenyReason::ValidationFailed.user_message(),
            "账号已失效，请重新登录"
        );
        assert_eq!(
            MonitorDenyReason::AlreadyMonitoring.user_message(),
            "账号已在监听中"
        );
        assert_eq!(
            MonitorDenyReason::ScriptInjectionFailed.user_message(),
            "监听脚本启动失败，请重试"
        );
    }

    #[test]
    fn deny_reasons_serialize_as_snake_case() {
        let json = serde_json::to_string(&MonitorDenyReason::ValidationFailed).unwrap();
        assert_eq!(json, "\"validation_failed\"");
    }
}
