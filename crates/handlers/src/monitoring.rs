// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The monitoring route group.

use std::time::Duration;

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tabfleet_core::sync::BatchSyncOptions;
use tabfleet_data_model::{AccountRef, Platform};

use crate::{ApiResponse, AppState, RouteError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StartBody {
    platform: String,
    account_id: String,
    cookie_file: Utf8PathBuf,
    headless: Option<bool>,
}

#[tracing::instrument(name = "handlers.monitoring.start", skip_all)]
pub(crate) async fn start(
    State(state): State<AppState>,
    Json(body): Json<StartBody>,
) -> Result<Response, RouteError> {
    if body.platform.is_empty() || body.account_id.is_empty() {
        return Err(RouteError::Validation(
            "platform and accountId are required".to_owned(),
        ));
    }

    let account = AccountRef {
        platform: Platform::new(body.platform),
        account_id: body.account_id,
        cookie_file: body.cookie_file,
    };
    let outcome = state
        .core
        .monitor
        .start_single(account, body.headless.unwrap_or(true))
        .await;

    let response = Json(ApiResponse {
        success: outcome.success,
        error: outcome.message.clone().filter(|_| !outcome.success),
        data: Some(outcome),
    });
    Ok(response.into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StopBody {
    account_key: String,
}

#[tracing::instrument(name = "handlers.monitoring.stop", skip_all)]
pub(crate) async fn stop(
    State(state): State<AppState>,
    Json(body): Json<StopBody>,
) -> Result<Response, RouteError> {
    if body.account_key.is_empty() {
        return Err(RouteError::Validation("accountKey is required".to_owned()));
    }
    state.core.monitor.stop(&body.account_key).await?;
    Ok(ApiResponse::ok(serde_json::json!({ "stopped": body.account_key })).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchSyncOptionsBody {
    concurrency: Option<usize>,
    timeout_secs: Option<u64>,
    full_sync: Option<bool>,
}

impl BatchSyncOptionsBody {
    pub(crate) fn into_options(self) -> BatchSyncOptions {
        let defaults = BatchSyncOptions::default();
        BatchSyncOptions {
            concurrency: self.concurrency.unwrap_or(defaults.concurrency),
            timeout: self
                .timeout_secs
                .map_or(defaults.timeout, Duration::from_secs),
            full_sync: self.full_sync.unwrap_or(defaults.full_sync),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccountBody {
    platform: String,
    account_id: String,
    cookie_file: Utf8PathBuf,
}

impl AccountBody {
    pub(crate) fn into_ref(self) -> AccountRef {
        AccountRef {
            platform: Platform::new(self.platform),
            account_id: self.account_id,
            cookie_file: self.cookie_file,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchStartBody {
    accounts: Option<Vec<AccountBody>>,
    with_sync: Option<bool>,
    sync_options: Option<BatchSyncOptionsBody>,
}

#[tracing::instrument(name = "handlers.monitoring.batch_start", skip_all)]
pub(crate) async fn batch_start(
    State(state): State<AppState>,
    Json(body): Json<BatchStartBody>,
) -> Result<Response, RouteError> {
    let accounts = body
        .accounts
        .map(|accounts| accounts.into_iter().map(AccountBody::into_ref).collect());
    let report = state
        .core
        .monitor
        .batch_start(
            accounts,
            body.with_sync.unwrap_or(false),
            body.sync_options.map(BatchSyncOptionsBody::into_options),
        )
        .await?;
    Ok(ApiResponse::ok(report).into_response())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopAllReply {
    stopped: usize,
}

#[tracing::instrument(name = "handlers.monitoring.stop_all", skip_all)]
pub(crate) async fn stop_all(State(state): State<AppState>) -> Response {
    let stopped = state.core.monitor.stop_all().await;
    ApiResponse::ok(StopAllReply { stopped }).into_response()
}

#[tracing::instrument(name = "handlers.monitoring.status", skip_all)]
pub(crate) async fn status(State(state): State<AppState>) -> Response {
    let rows = state.core.monitor.status().await;
    ApiResponse::ok(rows).into_response()
}
