// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The upload pipeline.
//!
//! One job is a linear state machine (validate the cookie, drive the upload,
//! await the publish redirect) with every transition checkpointed to the
//! publish-record store, so an operator can reconstruct any upload across a
//! process restart. Whatever path the job takes out, an acquired tab is
//! closed before the job returns.

use std::{sync::Arc, time::Duration};

use camino::{Utf8Path, Utf8PathBuf};
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use tabfleet_data_model::{
    publish_status, Platform, PluginKind, PublishState, PublishStatusPatch, TabId, UploadRequest,
};
use tabfleet_storage::{BoxRepositoryFactory, Clock, Repository as _, RepositoryAccess};
use ulid::Ulid;

use crate::{
    broker::{TabBroker, UrlChange},
    error::{CoreError, TimeoutPhase},
    registry::PluginRegistry,
};

/// How long the pipeline waits for the platform to publish after an upload.
const PUBLISH_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
/// Gap between jobs of a batch, to stay under target-site rate limits.
const BATCH_GAP: Duration = Duration::from_secs(1);

/// Outcome of one upload job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadJobResult {
    /// Target platform.
    pub platform: Platform,
    /// Account the job ran for.
    pub account_name: String,
    /// The uploaded file.
    pub file_path: Utf8PathBuf,
    /// Whether the job reached the published state.
    pub success: bool,
    /// Failure detail.
    pub error: Option<String>,
}

/// Which state the job failed in; decides the terminal status strings.
enum FailedPhase {
    Validate,
    Upload,
    PublishWait,
}

/// Per-upload state machine with persisted progress.
pub struct UploadPipeline {
    registry: Arc<PluginRegistry>,
    broker: Arc<dyn TabBroker>,
    repos: BoxRepositoryFactory,
}

impl UploadPipeline {
    /// Creates the pipeline.
    #[must_use]
    pub fn new(
        registry: Arc<PluginRegistry>,
        broker: Arc<dyn TabBroker>,
        repos: BoxRepositoryFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            broker,
            repos,
        })
    }

    /// Runs one single-account upload job to completion.
    ///
    /// Never returns an `Err`: failures are folded into the result and the
    /// terminal state is persisted under the request's record id.
    #[tracing::instrument(
        name = "upload.video",
        skip_all,
        fields(platform = %request.platform, file = %request.file_path),
    )]
    pub async fn upload_video(&self, request: UploadRequest) -> UploadJobResult {
        let account_name = request
            .account_name
            .clone()
            .unwrap_or_else(|| derive_account_name(&request.cookie_file));

        let mut tab: Option<TabId> = None;
        let outcome = self.run(&request, &account_name, &mut tab).await;

        // The tab, if the upload plugin acquired one, is closed on every
        // exit path.
        if let Some(tab) = tab.take() {
            if let Err(e) = self.broker.close_tab(&tab).await {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    %tab,
                    "upload tab close failed",
                );
            }
        }

        match outcome {
            Ok(()) => {
                tracing::info!(account_name, "upload job finished");
                UploadJobResult {
                    platform: request.platform.clone(),
                    account_name,
                    file_path: request.file_path.clone(),
                    success: true,
                    error: None,
                }
            }
            Err((phase, e)) => {
                self.persist_failure(&request, &account_name, &phase, &e).await;
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    account_name,
                    "upload job failed",
                );
                UploadJobResult {
                    platform: request.platform.clone(),
                    account_name,
                    file_path: request.file_path.clone(),
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Dispatches the jobs sequentially with a one-second gap between them.
    /// Failed jobs are collected, never fatal to the batch.
    pub async fn batch_upload(&self, requests: Vec<UploadRequest>) -> Vec<UploadJobResult> {
        let total = requests.len();
        let mut results = Vec::with_capacity(total);
        for (index, request) in requests.into_iter().enumerate() {
            results.push(self.upload_video(request).await);
            if index + 1 < total {
                tokio::time::sleep(BATCH_GAP).await;
            }
        }
        results
    }

    async fn run(
        &self,
        request: &UploadRequest,
        account_name: &str,
        tab: &mut Option<TabId>,
    ) -> Result<(), (FailedPhase, CoreError)> {
        // validating
        self.checkpoint(
            request.record_id,
            account_name,
            PublishStatusPatch::upload(publish_status::VALIDATING),
        )
        .await;

        let validator = self
            .registry
            .validate(&request.platform)
            .ok_or_else(|| {
                (
                    FailedPhase::Validate,
                    CoreError::PluginUnavailable {
                        kind: PluginKind::Validate,
                        platform: request.platform.clone(),
                    },
                )
            })?;
        let valid = validator
            .validate_cookie(&request.cookie_file)
            .await
            .map_err(|e| (FailedPhase::Validate, e))?;
        if !valid {
            return Err((
                FailedPhase::Validate,
                CoreError::SessionInvalid {
                    account: account_name.to_owned(),
                },
            ));
        }

        // uploading
        self.checkpoint(
            request.record_id,
            account_name,
            PublishStatusPatch::upload(publish_status::UPLOADING),
        )
        .await;

        let uploader = self.registry.upload(&request.platform).ok_or_else(|| {
            (
                FailedPhase::Upload,
                CoreError::PluginUnavailable {
                    kind: PluginKind::Upload,
                    platform: request.platform.clone(),
                },
            )
        })?;
        let outcome = uploader
            .upload_video_complete(request)
            .await
            .map_err(|e| (FailedPhase::Upload, e))?;
        *tab = outcome.tab_id.clone();
        if !outcome.success {
            return Err((
                FailedPhase::Upload,
                CoreError::Transient(anyhow::anyhow!(
                    "upload rejected: {}",
                    outcome.error.unwrap_or_else(|| "unspecified".to_owned())
                )),
            ));
        }
        let Some(publish_tab) = tab.clone() else {
            return Err((
                FailedPhase::Upload,
                CoreError::Transient(anyhow::anyhow!("upload plugin returned no tab")),
            ));
        };

        // awaiting publish
        self.checkpoint(
            request.record_id,
            account_name,
            PublishStatusPatch::upload(publish_status::UPLOADED)
                .with_push(publish_status::PUSHING),
        )
        .await;

        match self
            .broker
            .wait_for_url_change(&publish_tab, PUBLISH_WAIT_TIMEOUT)
            .await
        {
            Ok(UrlChange::Changed(url)) => {
                tracing::debug!(url, "publish redirect observed");
            }
            Ok(UrlChange::TimedOut) => {
                return Err((
                    FailedPhase::PublishWait,
                    CoreError::Timeout {
                        phase: TimeoutPhase::PublishWait,
                        timeout: PUBLISH_WAIT_TIMEOUT,
                    },
                ));
            }
            Err(e) => return Err((FailedPhase::PublishWait, e.into())),
        }

        // The platform may expose richer profile data once published; best
        // effort only.
        if let Ok(info) = uploader.account_info(&publish_tab).await {
            tracing::debug!(nickname = info.nickname.as_deref(), "upload account profile");
        }

        self.checkpoint(
            request.record_id,
            account_name,
            PublishStatusPatch::default()
                .with_push(publish_status::PUSH_OK)
                .with_review(publish_status::REVIEW_OK)
                .with_state(PublishState::Success),
        )
        .await;

        Ok(())
    }

    async fn persist_failure(
        &self,
        request: &UploadRequest,
        account_name: &str,
        phase: &FailedPhase,
        error: &CoreError,
    ) {
        let patch = match phase {
            FailedPhase::Validate => PublishStatusPatch::upload(publish_status::VALIDATE_FAILED)
                .with_push(publish_status::PUSH_FAILED)
                .with_review(publish_status::REVIEW_FAILED),
            FailedPhase::Upload => PublishStatusPatch::default()
                .with_push(publish_status::PUSH_FAILED)
                .with_review(publish_status::REVIEW_FAILED),
            FailedPhase::PublishWait => {
                if matches!(error, CoreError::Timeout { .. }) {
                    PublishStatusPatch::default()
                        .with_push(publish_status::PUSH_TIMEOUT)
                        .with_review(publish_status::REVIEW_UNKNOWN)
                } else {
                    PublishStatusPatch::default()
                        .with_push(publish_status::PUSH_ERROR)
                        .with_review(publish_status::REVIEW_FAILED)
                }
            }
        };
        let patch = patch
            .with_error(error.to_string())
            .with_state(PublishState::Failed);
        self.checkpoint(request.record_id, account_name, patch).await;
    }

    /// Writes one progress checkpoint. Checkpoint failures are logged, never
    /// fatal to the job.
    async fn checkpoint(
        &self,
        record_id: Option<Ulid>,
        account_name: &str,
        patch: PublishStatusPatch,
    ) {
        let Some(record_id) = record_id else { return };
        let result = async {
            let mut repo = self.repos.create().await?;
            repo.publish_record()
                .update_account_status(record_id, account_name, patch)
                .await?;
            repo.save().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                record.id = %record_id,
                "publish checkpoint write failed",
            );
        }
    }
}

/// Derives the account display name from a cookie bundle's file name:
/// the second `_`-separated segment, by convention `platform_account_….json`.
#[must_use]
pub fn derive_account_name(cookie_file: &Utf8Path) -> String {
    let stem = cookie_file.file_stem().unwrap_or("unknown");
    stem.split('_')
        .nth(1)
        .filter(|segment| !segment.is_empty())
        .unwrap_or(stem)
        .to_owned()
}

/// Makes a video filename unique by appending a timestamp+nonce suffix
/// before the extension.
#[must_use]
pub fn unique_video_path(dir: &Utf8Path, file_name: &str, clock: &dyn Clock) -> Utf8PathBuf {
    let stamp = clock.now().format("%Y%m%d%H%M%S");
    let nonce: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    let unique = match file_name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}_{stamp}_{nonce}.{ext}"),
        None => format!("{file_name}_{stamp}_{nonce}"),
    };
    dir.join(unique)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use camino::{Utf8Path, Utf8PathBuf};
    use tabfleet_data_model::{
        publish_status, NewPublishRecord, Platform, PublishState, UploadRequest,
    };
    use tabfleet_storage::{RepositoryAccess, RepositoryFactory, SystemClock};
    use tabfleet_storage_mem::MemRepositoryFactory;
    use ulid::Ulid;

    use super::{derive_account_name, unique_video_path, UploadPipeline};
    use crate::{
        broker::UrlChange,
        registry::PluginRegistry,
        testing::{FakeBroker, FakeUploadPlugin, FakeValidatePlugin},
    };

    struct Setup {
        pipeline: Arc<UploadPipeline>,
        broker: Arc<FakeBroker>,
        validator: Arc<FakeValidatePlugin>,
        uploader: Arc<FakeUploadPlugin>,
        repos: Arc<MemRepositoryFactory>,
    }

    fn setup() -> Setup {
        let broker = Arc::new(FakeBroker::new());
        let validator = Arc::new(FakeValidatePlugin::new("wechat"));
        let uploader = Arc::new(FakeUploadPlugin::new("wechat", broker.clone()));
        let registry = Arc::new(
            PluginRegistry::builder()
                .upload(Ok(uploader.clone()))
                .validate(Ok(validator.clone()))
                .build()
                .unwrap(),
        );
        let repos = Arc::new(MemRepositoryFactory::new());
        let pipeline = UploadPipeline::new(registry, broker.clone(), repos.clone());
        Setup {
            pipeline,
            broker,
            validator,
            uploader,
            repos,
        }
    }

    async fn new_record(repos: &MemRepositoryFactory, account: &str) -> Ulid {
        let mut repo = repos.create().await.unwrap();
        let record = repo
            .publish_record()
            .add(
                &SystemClock,
                NewPublishRecord {
                    file_path: Utf8PathBuf::from("/videos/demo.mp4"),
                    title: "t".to_owned(),
                    accounts: vec![account.to_owned()],
                },
            )
            .await
            .unwrap();
        record.id
    }

    fn request(record_id: Ulid) -> UploadRequest {
        UploadRequest {
            platform: Platform::new("wechat"),
            account_name: Some("alice".to_owned()),
            cookie_file: Utf8PathBuf::from("/cookies/wechat_alice_1.json"),
            file_path: Utf8PathBuf::from("/videos/demo.mp4"),
            title: "t".to_owned(),
            tags: vec!["tag".to_owned()],
            category: None,
            publish_at: None,
            enable_original: false,
            add_to_collection: false,
            record_id: Some(record_id),
        }
    }

    async fn slice(
        repos: &MemRepositoryFactory,
        record_id: Ulid,
    ) -> tabfleet_data_model::PublishAccountState {
        let mut repo = repos.create().await.unwrap();
        let record = repo
            .publish_record()
            .lookup(record_id)
            .await
            .unwrap()
            .unwrap();
        record.accounts[0].clone()
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_persists_success_and_releases_the_tab() {
        let s = setup();
        let record_id = new_record(&s.repos, "alice").await;

        let result = s.pipeline.upload_video(request(record_id)).await;
        assert!(result.success, "job failed: {:?}", result.error);

        let slice = slice(&s.repos, record_id).await;
        assert_eq!(slice.upload_status.as_deref(), Some(publish_status::UPLOADED));
        assert_eq!(slice.push_status.as_deref(), Some(publish_status::PUSH_OK));
        assert_eq!(slice.review_status.as_deref(), Some(publish_status::REVIEW_OK));
        assert_eq!(slice.state, PublishState::Success);

        // Final tab count unchanged.
        assert_eq!(s.broker.open_tab_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_cookie_fails_before_any_upload_tab() {
        let s = setup();
        let record_id = new_record(&s.repos, "alice").await;
        s.validator.push_verdict(false);

        let result = s.pipeline.upload_video(request(record_id)).await;
        assert!(!result.success);

        let slice = slice(&s.repos, record_id).await;
        assert_eq!(
            slice.upload_status.as_deref(),
            Some(publish_status::VALIDATE_FAILED)
        );
        assert_eq!(slice.push_status.as_deref(), Some(publish_status::PUSH_FAILED));
        assert_eq!(
            slice.review_status.as_deref(),
            Some(publish_status::REVIEW_FAILED)
        );
        assert_eq!(slice.state, PublishState::Failed);

        assert_eq!(s.uploader.calls(), 0);
        assert_eq!(s.broker.open_tab_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_wait_timeout_is_recorded_and_the_tab_still_closes() {
        let s = setup();
        let record_id = new_record(&s.repos, "alice").await;
        s.broker.push_url_change(UrlChange::TimedOut);

        let result = s.pipeline.upload_video(request(record_id)).await;
        assert!(!result.success);

        let slice = slice(&s.repos, record_id).await;
        assert_eq!(
            slice.push_status.as_deref(),
            Some(publish_status::PUSH_TIMEOUT)
        );
        assert_eq!(
            slice.review_status.as_deref(),
            Some(publish_status::REVIEW_UNKNOWN)
        );
        assert_eq!(slice.state, PublishState::Failed);
        assert_eq!(s.broker.open_tab_count(), 0);
    }

    #[test]
    fn account_name_derives_from_the_cookie_basename() {
        assert_eq!(
            derive_account_name(Utf8Path::new("/cookies/wechat_alice_1719555.json")),
            "alice"
        );
        assert_eq!(derive_account_name(Utf8Path::new("/cookies/solo.json")), "solo");
    }

    #[test]
    fn unique_video_path_appends_suffix_before_extension() {
        let path = unique_video_path(Utf8Path::new("/videos"), "clip.mp4", &SystemClock);
        let name = path.file_name().unwrap();
        assert!(name.starts_with("clip_"));
        assert!(name.ends_with(".mp4"));
        assert_ne!(name, "clip.mp4");
    }
}
