// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! Avatar file serving.

use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use hyper::StatusCode;

use crate::{ApiResponse, AppState};

fn content_type(file: &str) -> &'static str {
    match file.rsplit_once('.').map(|(_, ext)| ext) {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Serves `<avatar_dir>/<platform>/<account>/<file>`.
///
/// Any path component containing `..` is rejected with 400 before the
/// filesystem is touched.
#[tracing::instrument(name = "handlers.assets.avatar", skip_all)]
pub(crate) async fn avatar(
    State(state): State<AppState>,
    Path((platform, account, file)): Path<(String, String, String)>,
) -> Response {
    for component in [&platform, &account, &file] {
        if component.contains("..") {
            return (
                StatusCode::BAD_REQUEST,
                ApiResponse::<()>::err("path traversal rejected"),
            )
                .into_response();
        }
    }

    let path = state
        .paths
        .avatar_dir
        .join(&platform)
        .join(&account)
        .join(&file);
    match tokio::fs::read(path.as_std_path()).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type(&file))],
            bytes,
        )
            .into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            ApiResponse::<()>::err("avatar not found"),
        )
            .into_response(),
    }
}
