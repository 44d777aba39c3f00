// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! In-memory implementation of the publish-record store.

use async_trait::async_trait;
use tabfleet_data_model::{
    NewPublishRecord, PublishAccountState, PublishRecord, PublishStatusPatch,
};
use tabfleet_storage::{Clock, Pagination, PublishRecordRepository, RepositoryError};
use ulid::Ulid;

use crate::{lock_state, SharedState};

/// An implementation of [`PublishRecordRepository`] over the shared state
/// block.
pub struct MemPublishRecordRepository {
    state: SharedState,
}

impl MemPublishRecordRepository {
    pub(crate) fn new(state: SharedState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl PublishRecordRepository for MemPublishRecordRepository {
    #[tracing::instrument(name = "db.publish_record.add", skip_all, fields(record.id), err)]
    async fn add(
        &mut self,
        clock: &dyn Clock,
        record: NewPublishRecord,
    ) -> Result<PublishRecord, RepositoryError> {
        let id = Ulid::new();
        tracing::Span::current().record("record.id", tracing::field::display(id));

        let record = PublishRecord {
            id,
            file_path: record.file_path,
            title: record.title,
            created_at: clock.now(),
            accounts: record
                .accounts
                .into_iter()
                .map(PublishAccountState::pending)
                .collect(),
        };

        let mut state = lock_state(&self.state)?;
        state.publish_records.insert(id, record.clone());
        Ok(record)
    }

    #[tracing::instrument(name = "db.publish_record.lookup", skip_all, fields(record.id = %id), err)]
    async fn lookup(&mut self, id: Ulid) -> Result<Option<PublishRecord>, RepositoryError> {
        let state = lock_state(&self.state)?;
        Ok(state.publish_records.get(&id).cloned())
    }

    #[tracing::instrument(name = "db.publish_record.list", skip_all, err)]
    async fn list(
        &mut self,
        pagination: Pagination,
    ) -> Result<Vec<PublishRecord>, RepositoryError> {
        let state = lock_state(&self.state)?;
        Ok(state
            .publish_records
            .values()
            .rev()
            .skip(pagination.offset)
            .take(pagination.limit)
            .cloned()
            .collect())
    }

    #[tracing::instrument(
        name = "db.publish_record.update_account_status",
        skip_all,
        fields(record.id = %id, record.account = account_name),
        err,
    )]
    async fn update_account_status(
        &mut self,
        id: Ulid,
        account_name: &str,
        patch: PublishStatusPatch,
    ) -> Result<(), RepositoryError> {
        let mut state = lock_state(&self.state)?;
        let Some(record) = state.publish_records.get_mut(&id) else {
            return Ok(());
        };
        let Some(slice) = record
            .accounts
            .iter_mut()
            .find(|a| a.account_name == account_name)
        else {
            return Ok(());
        };

        if let Some(upload_status) = patch.upload_status {
            slice.upload_status = Some(upload_status);
        }
        if let Some(push_status) = patch.push_status {
            slice.push_status = Some(push_status);
        }
        if let Some(review_status) = patch.review_status {
            slice.review_status = Some(review_status);
        }
        if let Some(error_message) = patch.error_message {
            slice.error_message = Some(error_message);
        }
        if let Some(new_state) = patch.state {
            slice.state = new_state;
        }
        Ok(())
    }
}
