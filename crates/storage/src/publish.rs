// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use async_trait::async_trait;
use tabfleet_data_model::{NewPublishRecord, PublishRecord, PublishStatusPatch};
use ulid::Ulid;

use crate::{Clock, Pagination, RepositoryError};

/// The publish-record store.
///
/// Upload jobs checkpoint their progress here; the per-account status
/// columns are sufficient to reconstruct the state of any upload across a
/// process restart.
#[async_trait]
pub trait PublishRecordRepository: Send {
    /// Creates a record with pending slices for every account.
    async fn add(
        &mut self,
        clock: &dyn Clock,
        record: NewPublishRecord,
    ) -> Result<PublishRecord, RepositoryError>;

    /// Looks up a record.
    async fn lookup(&mut self, id: Ulid) -> Result<Option<PublishRecord>, RepositoryError>;

    /// Lists records, newest first.
    async fn list(&mut self, pagination: Pagination) -> Result<Vec<PublishRecord>, RepositoryError>;

    /// Applies a status patch to one account's slice of a record.
    ///
    /// Unknown records and unknown account slices are ignored: checkpoint
    /// writes must never fail an upload job.
    async fn update_account_status(
        &mut self,
        id: Ulid,
        account_name: &str,
        patch: PublishStatusPatch,
    ) -> Result<(), RepositoryError>;
}
