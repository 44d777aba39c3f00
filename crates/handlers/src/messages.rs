// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The message route group: manual sync, sending, and store queries.

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use camino::Utf8PathBuf;
use serde::Deserialize;
use tabfleet_core::{plugin::SendParams, sync::SyncOptions};
use tabfleet_data_model::{MessageKind, Platform, TabId};
use tabfleet_storage::{Pagination, Repository as _, RepositoryAccess, ThreadFilter};
use ulid::Ulid;

use crate::{ApiResponse, AppState, RouteError};
use super::monitoring::AccountBody;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SyncBody {
    platform: String,
    account_id: String,
    cookie_file: Utf8PathBuf,
    full_sync: Option<bool>,
}

#[tracing::instrument(name = "handlers.messages.sync", skip_all)]
pub(crate) async fn sync(
    State(state): State<AppState>,
    Json(body): Json<SyncBody>,
) -> Result<Response, RouteError> {
    if body.platform.is_empty() || body.account_id.is_empty() {
        return Err(RouteError::Validation(
            "platform and accountId are required".to_owned(),
        ));
    }
    let report = state
        .core
        .engine
        .sync_platform_messages(
            &Platform::new(body.platform),
            &body.account_id,
            &body.cookie_file,
            SyncOptions {
                full_sync: body.full_sync.unwrap_or(false),
            },
        )
        .await?;
    Ok(ApiResponse::ok(report).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SyncBatchBody {
    accounts: Vec<AccountBody>,
    options: Option<super::monitoring::BatchSyncOptionsBody>,
}

#[tracing::instrument(name = "handlers.messages.sync_batch", skip_all)]
pub(crate) async fn sync_batch(
    State(state): State<AppState>,
    Json(body): Json<SyncBatchBody>,
) -> Result<Response, RouteError> {
    if body.accounts.is_empty() {
        return Err(RouteError::Validation("accounts are required".to_owned()));
    }
    let accounts: Vec<_> = body
        .accounts
        .into_iter()
        .map(AccountBody::into_ref)
        .collect();
    let options = body
        .options
        .map(super::monitoring::BatchSyncOptionsBody::into_options)
        .unwrap_or_default();
    let report = state.core.engine.batch_sync(&accounts, options).await;
    Ok(ApiResponse::ok(report).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SendBody {
    platform: String,
    tab_id: String,
    user_name: String,
    content: String,
    #[serde(rename = "type")]
    kind: MessageKind,
}

#[tracing::instrument(name = "handlers.messages.send", skip_all)]
pub(crate) async fn send(
    State(state): State<AppState>,
    Json(body): Json<SendBody>,
) -> Result<Response, RouteError> {
    send_one(&state, body).await.map(IntoResponse::into_response)
}

async fn send_one(
    state: &AppState,
    body: SendBody,
) -> Result<Json<ApiResponse<tabfleet_data_model::SendReport>>, RouteError> {
    if body.platform.is_empty() || body.tab_id.is_empty() || body.user_name.is_empty() {
        return Err(RouteError::Validation(
            "platform, tabId and userName are required".to_owned(),
        ));
    }
    let report = state
        .core
        .engine
        .send_message(
            &Platform::new(body.platform),
            SendParams {
                tab_id: TabId::new(body.tab_id),
                user_name: body.user_name,
                content: body.content,
                kind: body.kind,
            },
        )
        .await?;
    let success = report.success;
    Ok(Json(ApiResponse {
        success,
        error: report.error.clone().filter(|_| !success),
        data: Some(report),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SendBatchBody {
    messages: Vec<SendBody>,
}

#[tracing::instrument(name = "handlers.messages.send_batch", skip_all)]
pub(crate) async fn send_batch(
    State(state): State<AppState>,
    Json(body): Json<SendBatchBody>,
) -> Result<Response, RouteError> {
    if body.messages.is_empty() {
        return Err(RouteError::Validation("messages are required".to_owned()));
    }
    let mut results = Vec::with_capacity(body.messages.len());
    for message in body.messages {
        match send_one(&state, message).await {
            Ok(Json(envelope)) => results.push(envelope),
            Err(e) => results.push(ApiResponse {
                success: false,
                data: None,
                error: Some(e.to_string()),
            }),
        }
    }
    Ok(ApiResponse::ok(results).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoreQuery {
    platform: Option<String>,
    account_id: Option<String>,
    keyword: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl StoreQuery {
    fn filter(&self) -> ThreadFilter {
        let mut filter = ThreadFilter::new();
        if let Some(platform) = &self.platform {
            filter = filter.for_platform(Platform::new(platform.clone()));
        }
        if let Some(account_id) = &self.account_id {
            filter = filter.for_account(account_id.clone());
        }
        filter
    }

    fn pagination(&self) -> Pagination {
        let defaults = Pagination::default();
        Pagination::new(
            self.limit.unwrap_or(defaults.limit),
            self.offset.unwrap_or(defaults.offset),
        )
    }
}

#[tracing::instrument(name = "handlers.messages.threads", skip_all)]
pub(crate) async fn threads(
    State(state): State<AppState>,
    Query(query): Query<StoreQuery>,
) -> Result<Response, RouteError> {
    let mut repo = state.core.repos.create().await?;
    let threads = repo
        .message()
        .list_threads(query.filter(), query.pagination())
        .await?;
    Ok(ApiResponse::ok(threads).into_response())
}

#[tracing::instrument(name = "handlers.messages.thread_messages", skip_all)]
pub(crate) async fn thread_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StoreQuery>,
) -> Result<Response, RouteError> {
    let thread_id = Ulid::from_string(&id)
        .map_err(|_| RouteError::Validation(format!("malformed thread id {id}")))?;
    let mut repo = state.core.repos.create().await?;
    let messages = repo
        .message()
        .thread_messages(thread_id, query.pagination())
        .await?;
    Ok(ApiResponse::ok(messages).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MarkReadBody {
    thread_id: String,
    message_ids: Option<Vec<String>>,
}

#[tracing::instrument(name = "handlers.messages.mark_read", skip_all)]
pub(crate) async fn mark_read(
    State(state): State<AppState>,
    Json(body): Json<MarkReadBody>,
) -> Result<Response, RouteError> {
    let thread_id = Ulid::from_string(&body.thread_id)
        .map_err(|_| RouteError::Validation("malformed thread id".to_owned()))?;
    let message_ids = body
        .message_ids
        .map(|ids| {
            ids.iter()
                .map(|id| {
                    Ulid::from_string(id)
                        .map_err(|_| RouteError::Validation(format!("malformed message id {id}")))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    let mut repo = state.core.repos.create().await?;
    let changed = repo
        .message()
        .mark_read(thread_id, message_ids.as_deref())
        .await?;
    repo.save().await?;
    Ok(ApiResponse::ok(serde_json::json!({ "marked": changed })).into_response())
}

#[tracing::instrument(name = "handlers.messages.search", skip_all)]
pub(crate) async fn search(
    State(state): State<AppState>,
    Query(query): Query<StoreQuery>,
) -> Result<Response, RouteError> {
    let keyword = query
        .keyword
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| RouteError::Validation("keyword is required".to_owned()))?;
    let mut repo = state.core.repos.create().await?;
    let hits = repo
        .message()
        .search(query.filter(), keyword, query.pagination())
        .await?;
    Ok(ApiResponse::ok(hits).into_response())
}

#[tracing::instrument(name = "handlers.messages.statistics", skip_all)]
pub(crate) async fn statistics(
    State(state): State<AppState>,
    Query(query): Query<StoreQuery>,
) -> Result<Response, RouteError> {
    let mut repo = state.core.repos.create().await?;
    let stats = repo.message().statistics(query.filter()).await?;
    Ok(ApiResponse::ok(stats).into_response())
}

#[tracing::instrument(name = "handlers.messages.unread_count", skip_all)]
pub(crate) async fn unread_count(
    State(state): State<AppState>,
    Query(query): Query<StoreQuery>,
) -> Result<Response, RouteError> {
    let mut repo = state.core.repos.create().await?;
    let unread = repo.message().unread_count(query.filter()).await?;
    Ok(ApiResponse::ok(serde_json::json!({ "unread": unread })).into_response())
}
