// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! In-memory implementation of the account repository.

use async_trait::async_trait;
use camino::Utf8Path;
use tabfleet_data_model::{Account, AccountStatus, Platform};
use tabfleet_storage::{AccountFilter, AccountRepository, Clock, RepositoryError};
use ulid::Ulid;

use crate::{lock_state, SharedState};

/// An implementation of [`AccountRepository`] over the shared state block.
pub struct MemAccountRepository {
    state: SharedState,
}

impl MemAccountRepository {
    pub(crate) fn new(state: SharedState) -> Self {
        Self { state }
    }
}

fn matches(filter: &AccountFilter, account: &Account) -> bool {
    if filter.platform().is_some_and(|p| *p != account.platform) {
        return false;
    }
    if let Some(group_id) = filter.group_id() {
        if account.group_id != Some(group_id) {
            return false;
        }
    }
    if filter.status().is_some_and(|s| s != account.status) {
        return false;
    }
    true
}

#[async_trait]
impl AccountRepository for MemAccountRepository {
    #[tracing::instrument(name = "db.account.lookup", skip_all, fields(account.id = %id), err)]
    async fn lookup(&mut self, id: Ulid) -> Result<Option<Account>, RepositoryError> {
        let state = lock_state(&self.state)?;
        Ok(state.accounts.get(&id).cloned())
    }

    #[tracing::instrument(
        name = "db.account.find",
        skip_all,
        fields(account.platform = %platform, account.account_id = account_id),
        err,
    )]
    async fn find(
        &mut self,
        platform: &Platform,
        account_id: &str,
    ) -> Result<Option<Account>, RepositoryError> {
        let state = lock_state(&self.state)?;
        Ok(state
            .accounts
            .values()
            .find(|a| a.platform == *platform && a.account_id == account_id)
            .cloned())
    }

    #[tracing::instrument(name = "db.account.list", skip_all, err)]
    async fn list(&mut self, filter: AccountFilter) -> Result<Vec<Account>, RepositoryError> {
        let state = lock_state(&self.state)?;
        Ok(state
            .accounts
            .values()
            .filter(|a| matches(&filter, a))
            .cloned()
            .collect())
    }

    #[tracing::instrument(
        name = "db.account.upsert",
        skip_all,
        fields(account.platform = %account.platform, account.account_id = account.account_id),
        err,
    )]
    async fn upsert(&mut self, account: Account) -> Result<Account, RepositoryError> {
        let mut state = lock_state(&self.state)?;
        let existing_id = state
            .accounts
            .values()
            .find(|a| a.platform == account.platform && a.account_id == account.account_id)
            .map(|a| a.id);

        // Keep the original row id stable across upserts.
        let mut account = account;
        if let Some(id) = existing_id {
            account.id = id;
        }
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    #[tracing::instrument(
        name = "db.account.update_status",
        skip_all,
        fields(account.id = %id, account.status = ?status),
        err,
    )]
    async fn update_status(
        &mut self,
        clock: &dyn Clock,
        id: Ulid,
        status: AccountStatus,
    ) -> Result<Account, RepositoryError> {
        let mut state = lock_state(&self.state)?;
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound { entity: "account" })?;
        account.status = status;
        account.last_check_time = Some(clock.now());
        Ok(account.clone())
    }

    #[tracing::instrument(name = "db.account.update_cookie_file", skip_all, fields(account.id = %id), err)]
    async fn update_cookie_file(
        &mut self,
        id: Ulid,
        cookie_file: &Utf8Path,
    ) -> Result<Account, RepositoryError> {
        let mut state = lock_state(&self.state)?;
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound { entity: "account" })?;
        account.cookie_file = cookie_file.to_owned();
        Ok(account.clone())
    }

    #[tracing::instrument(name = "db.account.monitorable", skip_all, err)]
    async fn monitorable(&mut self) -> Result<Vec<Account>, RepositoryError> {
        let state = lock_state(&self.state)?;
        Ok(state
            .accounts
            .values()
            .filter(|a| a.can_monitor && a.status != AccountStatus::Invalid)
            .cloned()
            .collect())
    }
}
