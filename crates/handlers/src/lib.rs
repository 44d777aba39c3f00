// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The tabfleet HTTP surface.
//!
//! JSON over HTTP in two envelopes: the monitoring/messaging/validation
//! groups answer `{success, data?, error?}`, the social-automation upload
//! group answers the legacy `{code, msg, data}` shape. Route handlers stay
//! thin; everything of substance happens in `tabfleet-core`.

#![deny(missing_docs)]

mod assets;
mod messages;
mod monitoring;
mod publish;

use std::sync::Arc;

use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use camino::Utf8PathBuf;
use hyper::StatusCode;
use serde::Serialize;
use tabfleet_core::{error::CoreError, Core};
use tower_http::trace::TraceLayer;

/// Filesystem roots the HTTP surface serves from.
#[derive(Debug, Clone)]
pub struct ServePaths {
    /// Where cookie bundles live.
    pub cookie_dir: Utf8PathBuf,
    /// Where uploadable videos live.
    pub video_dir: Utf8PathBuf,
    /// Where account avatars live.
    pub avatar_dir: Utf8PathBuf,
}

/// Shared state of every route handler.
#[derive(Clone)]
pub struct AppState {
    /// The orchestration core.
    pub core: Arc<Core>,
    /// Filesystem roots.
    pub paths: ServePaths,
}

/// The standard response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// Whether the operation succeeded.
    pub success: bool,
    /// The payload, on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Failure detail, on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// A success envelope.
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    /// A failure envelope.
    pub fn err(error: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(error.into()),
        })
    }
}

/// The legacy envelope of the social-automation group.
#[derive(Debug, Serialize)]
pub struct LegacyResponse<T> {
    /// 200 on success; an error code otherwise.
    pub code: i32,
    /// Human-readable outcome.
    pub msg: String,
    /// The payload.
    pub data: Option<T>,
}

impl<T> LegacyResponse<T> {
    /// A success envelope.
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            code: 200,
            msg: "success".to_owned(),
            data: Some(data),
        })
    }

    /// A failure envelope.
    pub fn err(code: i32, msg: impl Into<String>) -> Json<Self> {
        Json(Self {
            code,
            msg: msg.into(),
            data: None,
        })
    }
}

/// Errors a route can answer with.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RouteError {
    /// Missing or malformed inputs. 400.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A referenced entity does not exist. 404.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The operation ran and failed. 200 with a failure envelope, so
    /// plugin/tab trouble never turns into a transport error.
    #[error("{0}")]
    Failure(String),

    /// Something inside the service broke. 500.
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

macro_rules! impl_from_error_for_route {
    ($error:ty) => {
        impl From<$error> for RouteError {
            fn from(e: $error) -> Self {
                Self::Internal(Box::new(e))
            }
        }
    };
}

impl_from_error_for_route!(tabfleet_storage::RepositoryError);
impl_from_error_for_route!(std::io::Error);

impl From<CoreError> for RouteError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Validation(msg) => Self::Validation(msg),
            CoreError::NotFound { entity } => Self::NotFound(entity),
            CoreError::Storage(e) => Self::Internal(Box::new(e)),
            // Plugin, session, tab and timeout trouble is a normal negative
            // result at this boundary.
            other => Self::Failure(other.to_string()),
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ApiResponse::<()>::err(format!("invalid request: {msg}")),
            )
                .into_response(),
            Self::NotFound(entity) => (
                StatusCode::NOT_FOUND,
                ApiResponse::<()>::err(format!("{entity} not found")),
            )
                .into_response(),
            Self::Failure(msg) => ApiResponse::<()>::err(msg).into_response(),
            Self::Internal(e) => {
                tracing::error!(error = %e, "route failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiResponse::<()>::err(e.to_string()),
                )
                    .into_response()
            }
        }
    }
}

/// Builds the router over the given state.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        // Monitoring
        .route("/monitoring/start", post(monitoring::start))
        .route("/monitoring/stop", post(monitoring::stop))
        .route("/monitoring/batch-start", post(monitoring::batch_start))
        .route("/monitoring/stop-all", post(monitoring::stop_all))
        .route("/monitoring/status", get(monitoring::status))
        // Messages
        .route("/sync", post(messages::sync))
        .route("/sync/batch", post(messages::sync_batch))
        .route("/send", post(messages::send))
        .route("/send/batch", post(messages::send_batch))
        .route("/threads", get(messages::threads))
        .route("/threads/{id}/messages", get(messages::thread_messages))
        .route("/messages/mark-read", post(messages::mark_read))
        .route("/search", get(messages::search))
        .route("/statistics", get(messages::statistics))
        .route("/unread-count", get(messages::unread_count))
        // Social automation (legacy envelope)
        .route("/postVideo", post(publish::post_video))
        .route("/postVideoBatch", post(publish::post_video_batch))
        .route("/validateAccount", post(publish::validate_account))
        .route(
            "/validateAccountsBatch",
            post(publish::validate_accounts_batch),
        )
        // Assets
        .route("/avatar/{platform}/{account}/{file}", get(assets::avatar))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests;
