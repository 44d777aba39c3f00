// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The social-automation route group: uploads and account revalidation.
//!
//! This group answers the legacy `{code, msg, data}` envelope.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tabfleet_core::upload::{derive_account_name, unique_video_path, UploadJobResult};
use tabfleet_data_model::{
    AccountStatus, NewPublishRecord, Platform, PluginKind, UploadRequest,
};
use tabfleet_storage::{Clock as _, Repository as _, RepositoryAccess};
use ulid::Ulid;

use crate::{AppState, LegacyResponse};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PostVideoBody {
    file_list: Vec<String>,
    account_list: Vec<String>,
    #[serde(rename = "type")]
    platform_type: u8,
    title: String,
    #[serde(default)]
    tags: Vec<String>,
    category: Option<String>,
    enable_timer: Option<bool>,
    videos_per_day: Option<u32>,
    daily_times: Option<Vec<String>>,
    start_days: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PostVideoReply {
    results: Vec<UploadJobResult>,
    success_count: usize,
    failed_count: usize,
}

#[tracing::instrument(name = "handlers.publish.post_video", skip_all)]
pub(crate) async fn post_video(
    State(state): State<AppState>,
    Json(body): Json<PostVideoBody>,
) -> Response {
    match run_post_video(&state, body).await {
        Ok(reply) => LegacyResponse::ok(reply).into_response(),
        Err((code, msg)) => LegacyResponse::<PostVideoReply>::err(code, msg).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PostVideoBatchBody {
    jobs: Vec<PostVideoBody>,
}

#[tracing::instrument(name = "handlers.publish.post_video_batch", skip_all)]
pub(crate) async fn post_video_batch(
    State(state): State<AppState>,
    Json(body): Json<PostVideoBatchBody>,
) -> Response {
    let mut replies = Vec::with_capacity(body.jobs.len());
    for job in body.jobs {
        match run_post_video(&state, job).await {
            Ok(reply) => replies.push(LegacyResponse {
                code: 200,
                msg: "success".to_owned(),
                data: Some(reply),
            }),
            Err((code, msg)) => replies.push(LegacyResponse {
                code,
                msg,
                data: None,
            }),
        }
    }
    LegacyResponse::ok(replies).into_response()
}

async fn run_post_video(
    state: &AppState,
    body: PostVideoBody,
) -> Result<PostVideoReply, (i32, String)> {
    let Some(platform) = Platform::from_type_code(body.platform_type) else {
        return Err((400, format!("unsupported platform type {}", body.platform_type)));
    };
    if body.file_list.is_empty() || body.account_list.is_empty() {
        return Err((400, "fileList and accountList are required".to_owned()));
    }
    if body.title.is_empty() {
        return Err((400, "title is required".to_owned()));
    }

    // Cookie bundles may arrive as bare names relative to the cookie
    // directory.
    let cookies: Vec<Utf8PathBuf> = body
        .account_list
        .iter()
        .map(|entry| resolve_path(&state.paths.cookie_dir, entry))
        .collect();
    let account_names: Vec<String> = cookies
        .iter()
        .map(|cookie| derive_account_name(cookie))
        .collect();

    let mut files = Vec::with_capacity(body.file_list.len());
    for entry in &body.file_list {
        files.push(import_video(state, entry).await);
    }

    let publish_at = publish_times(
        state.core.clock.now(),
        body.enable_timer.unwrap_or(false),
        body.videos_per_day.unwrap_or(1),
        body.daily_times.as_deref().unwrap_or(&[]),
        body.start_days.unwrap_or(0),
        files.len(),
    );

    // One publish record per file, with a status slice per account.
    let mut requests = Vec::with_capacity(files.len() * cookies.len());
    for (file_index, file) in files.iter().enumerate() {
        let record_id = match create_record(state, file, &body.title, &account_names).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(error = %e, "publish record creation failed");
                None
            }
        };
        for (account_index, cookie) in cookies.iter().enumerate() {
            requests.push(UploadRequest {
                platform: platform.clone(),
                account_name: Some(account_names[account_index].clone()),
                cookie_file: cookie.clone(),
                file_path: file.clone(),
                title: body.title.clone(),
                tags: body.tags.clone(),
                category: body.category.clone(),
                publish_at: publish_at[file_index],
                enable_original: false,
                add_to_collection: false,
                record_id,
            });
        }
    }

    let results = state.core.upload.batch_upload(requests).await;
    let success_count = results.iter().filter(|r| r.success).count();
    let failed_count = results.len() - success_count;
    Ok(PostVideoReply {
        results,
        success_count,
        failed_count,
    })
}

fn resolve_path(base: &Utf8Path, entry: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(entry);
    if path.is_absolute() {
        path.to_owned()
    } else {
        base.join(path)
    }
}

/// Brings a video under the configured video directory, under a unique name
/// when it comes from outside.
async fn import_video(state: &AppState, entry: &str) -> Utf8PathBuf {
    let source = resolve_path(&state.paths.video_dir, entry);
    if source.starts_with(&state.paths.video_dir) {
        return source;
    }
    let Some(file_name) = source.file_name() else {
        return source;
    };
    let dest = unique_video_path(&state.paths.video_dir, file_name, state.core.clock.as_ref());
    match tokio::fs::copy(source.as_std_path(), dest.as_std_path()).await {
        Ok(_) => dest,
        Err(e) => {
            tracing::warn!(error = %e, %source, "video import failed, uploading in place");
            source
        }
    }
}

async fn create_record(
    state: &AppState,
    file: &Utf8Path,
    title: &str,
    accounts: &[String],
) -> Result<Ulid, tabfleet_storage::RepositoryError> {
    let mut repo = state.core.repos.create().await?;
    let record = repo
        .publish_record()
        .add(
            state.core.clock.as_ref(),
            NewPublishRecord {
                file_path: file.to_owned(),
                title: title.to_owned(),
                accounts: accounts.to_vec(),
            },
        )
        .await?;
    repo.save().await?;
    Ok(record.id)
}

/// Spreads scheduled publishes over days and daily slots.
fn publish_times(
    now: DateTime<Utc>,
    enable_timer: bool,
    videos_per_day: u32,
    daily_times: &[String],
    start_days: u32,
    count: usize,
) -> Vec<Option<DateTime<Utc>>> {
    if !enable_timer {
        return vec![None; count];
    }
    let per_day = videos_per_day.max(1);
    (0..count)
        .map(|index| {
            let index = index as u32;
            let day_offset = i64::from(start_days + index / per_day);
            let slot = (index % per_day) as usize;
            let time = daily_times
                .get(slot)
                .and_then(|s| NaiveTime::parse_from_str(s, "%H:%M").ok())
                .unwrap_or_else(|| NaiveTime::from_hms_opt(10, 0, 0).expect("valid time"));
            let date = (now + chrono::Duration::days(day_offset)).date_naive();
            Some(date.and_time(time).and_utc())
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ValidateAccountBody {
    account_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ValidateAccountReply {
    account_id: String,
    valid: bool,
}

#[tracing::instrument(name = "handlers.publish.validate_account", skip_all)]
pub(crate) async fn validate_account(
    State(state): State<AppState>,
    Json(body): Json<ValidateAccountBody>,
) -> Response {
    match run_validate(&state, &body.account_id).await {
        Ok(reply) => LegacyResponse::ok(reply).into_response(),
        Err((code, msg)) => LegacyResponse::<ValidateAccountReply>::err(code, msg).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ValidateAccountsBatchBody {
    account_ids: Vec<String>,
}

#[tracing::instrument(name = "handlers.publish.validate_accounts_batch", skip_all)]
pub(crate) async fn validate_accounts_batch(
    State(state): State<AppState>,
    Json(body): Json<ValidateAccountsBatchBody>,
) -> Response {
    let mut replies = Vec::with_capacity(body.account_ids.len());
    for account_id in &body.account_ids {
        match run_validate(&state, account_id).await {
            Ok(reply) => replies.push(LegacyResponse {
                code: 200,
                msg: "success".to_owned(),
                data: Some(reply),
            }),
            Err((code, msg)) => replies.push(LegacyResponse {
                code,
                msg,
                data: None,
            }),
        }
    }
    LegacyResponse::ok(replies).into_response()
}

async fn run_validate(
    state: &AppState,
    account_id: &str,
) -> Result<ValidateAccountReply, (i32, String)> {
    let id = Ulid::from_string(account_id)
        .map_err(|_| (400, format!("malformed account id {account_id}")))?;

    let mut repo = state
        .core
        .repos
        .create()
        .await
        .map_err(|e| (500, e.to_string()))?;
    let account = repo
        .account()
        .lookup(id)
        .await
        .map_err(|e| (500, e.to_string()))?
        .ok_or((404, format!("account {account_id} not found")))?;

    let Some(plugin) = state.core.registry.validate(&account.platform) else {
        return Err((
            500,
            format!(
                "no {} plugin registered for platform {}",
                PluginKind::Validate,
                account.platform
            ),
        ));
    };

    let valid = plugin
        .validate_cookie(&account.cookie_file)
        .await
        .map_err(|e| (500, e.to_string()))?;

    let status = if valid {
        AccountStatus::Valid
    } else {
        AccountStatus::Invalid
    };
    repo.account()
        .update_status(state.core.clock.as_ref(), id, status)
        .await
        .map_err(|e| (500, e.to_string()))?;
    repo.save().await.map_err(|e| (500, e.to_string()))?;

    Ok(ValidateAccountReply {
        account_id: account_id.to_owned(),
        valid,
    })
}
