// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{Platform, TabId};

/// The persisted status strings of the publish-record store.
///
/// These are the exact operator-facing values written by the upload pipeline;
/// they are compared verbatim by the operator UI and must not be reworded.
pub mod publish_status {
    /// `upload_status` while the cookie bundle is being checked.
    pub const VALIDATING: &str = "验证账号中";
    /// `upload_status` when the cookie bundle was rejected.
    pub const VALIDATE_FAILED: &str = "账号验证失败";
    /// `upload_status` while the file is being uploaded.
    pub const UPLOADING: &str = "上传中";
    /// `upload_status` once the platform accepted the file.
    pub const UPLOADED: &str = "上传成功";
    /// `push_status` while waiting for the platform to publish.
    pub const PUSHING: &str = "推送中";
    /// `push_status` when the publish completed.
    pub const PUSH_OK: &str = "推送成功";
    /// `push_status` when the job failed before the publish wait.
    pub const PUSH_FAILED: &str = "推送失败";
    /// `push_status` when the publish wait timed out.
    pub const PUSH_TIMEOUT: &str = "推送超时";
    /// `push_status` when the publish wait errored.
    pub const PUSH_ERROR: &str = "推送异常";
    /// `review_status` when the publish completed.
    pub const REVIEW_OK: &str = "发布成功";
    /// `review_status` when the job failed.
    pub const REVIEW_FAILED: &str = "发布失败";
    /// `review_status` when the publish outcome could not be observed.
    pub const REVIEW_UNKNOWN: &str = "状态未知";
}

/// Terminal state of one account's slice of a publish record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishState {
    /// No terminal write yet.
    Pending,
    /// The upload job finished and the publish was observed.
    Success,
    /// The upload job failed.
    Failed,
}

/// Parameters of one single-account upload job.
///
/// Transient: lives for one job. Progress checkpoints persist to the
/// publish-record store under `record_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    /// Target platform.
    pub platform: Platform,
    /// Account display name; derived from the cookie file when absent.
    pub account_name: Option<String>,
    /// Opaque path to the account's cookie bundle.
    pub cookie_file: Utf8PathBuf,
    /// The video file to upload.
    pub file_path: Utf8PathBuf,
    /// Video title.
    pub title: String,
    /// Video tags.
    pub tags: Vec<String>,
    /// Platform category, when the platform requires one.
    pub category: Option<String>,
    /// Scheduled publish time; publish immediately when absent.
    pub publish_at: Option<DateTime<Utc>>,
    /// Declare the video as original content.
    pub enable_original: bool,
    /// Add the video to the account's collection.
    pub add_to_collection: bool,
    /// Publish-record row receiving progress checkpoints.
    pub record_id: Option<Ulid>,
}

/// What an upload plugin reports back for one driven upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    /// Whether the platform accepted the upload.
    pub success: bool,
    /// The tab the upload ran in; stays open for the publish wait.
    pub tab_id: Option<TabId>,
    /// Failure detail.
    pub error: Option<String>,
}

/// One account's slice of a publish record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishAccountState {
    /// Account display name the slice belongs to.
    pub account_name: String,
    /// Upload-phase status string.
    pub upload_status: Option<String>,
    /// Push-phase status string.
    pub push_status: Option<String>,
    /// Review-phase status string.
    pub review_status: Option<String>,
    /// Failure detail.
    pub error_message: Option<String>,
    /// Terminal state.
    pub state: PublishState,
}

impl PublishAccountState {
    /// Creates a fresh, pending slice for an account.
    #[must_use]
    pub fn pending(account_name: String) -> Self {
        Self {
            account_name,
            upload_status: None,
            push_status: None,
            review_status: None,
            error_message: None,
            state: PublishState::Pending,
        }
    }
}

/// A publish record before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPublishRecord {
    /// The uploaded file.
    pub file_path: Utf8PathBuf,
    /// Video title.
    pub title: String,
    /// Accounts the file is published to.
    pub accounts: Vec<String>,
}

/// A persisted publish record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRecord {
    /// Store-assigned identifier.
    pub id: Ulid,
    /// The uploaded file.
    pub file_path: Utf8PathBuf,
    /// Video title.
    pub title: String,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// Per-account progress slices.
    pub accounts: Vec<PublishAccountState>,
}

/// A partial update to one account's slice of a publish record.
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishStatusPatch {
    /// New upload-phase status.
    pub upload_status: Option<String>,
    /// New push-phase status.
    pub push_status: Option<String>,
    /// New review-phase status.
    pub review_status: Option<String>,
    /// New failure detail.
    pub error_message: Option<String>,
    /// New terminal state.
    pub state: Option<PublishState>,
}

impl PublishStatusPatch {
    /// A patch setting only `upload_status`.
    #[must_use]
    pub fn upload(status: &str) -> Self {
        Self {
            upload_status: Some(status.to_owned()),
            ..Self::default()
        }
    }

    /// Sets `push_status`.
    #[must_use]
    pub fn with_push(mut self, status: &str) -> Self {
        self.push_status = Some(status.to_owned());
        self
    }

    /// Sets `review_status`.
    #[must_use]
    pub fn with_review(mut self, status: &str) -> Self {
        self.review_status = Some(status.to_owned());
        self
    }

    /// Sets the failure detail.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Sets the terminal state.
    #[must_use]
    pub fn with_state(mut self, state: PublishState) -> Self {
        self.state = Some(state);
        self
    }
}
