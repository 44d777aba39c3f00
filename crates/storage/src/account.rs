// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use async_trait::async_trait;
use camino::Utf8Path;
use tabfleet_data_model::{Account, AccountStatus, Platform};
use ulid::Ulid;

use crate::{Clock, RepositoryError};

/// Filter for account list queries.
///
/// An empty filter matches every account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountFilter {
    platform: Option<Platform>,
    group_id: Option<Ulid>,
    status: Option<AccountStatus>,
}

impl AccountFilter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one platform.
    #[must_use]
    pub fn for_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Restricts to one operator group.
    #[must_use]
    pub fn for_group(mut self, group_id: Ulid) -> Self {
        self.group_id = Some(group_id);
        self
    }

    /// Restricts to one validation status.
    #[must_use]
    pub fn with_status(mut self, status: AccountStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// The platform restriction, if any.
    #[must_use]
    pub fn platform(&self) -> Option<&Platform> {
        self.platform.as_ref()
    }

    /// The group restriction, if any.
    #[must_use]
    pub fn group_id(&self) -> Option<Ulid> {
        self.group_id
    }

    /// The status restriction, if any.
    #[must_use]
    pub fn status(&self) -> Option<AccountStatus> {
        self.status
    }
}

/// The account table.
#[async_trait]
pub trait AccountRepository: Send {
    /// Looks up an account by its store id.
    async fn lookup(&mut self, id: Ulid) -> Result<Option<Account>, RepositoryError>;

    /// Finds an account by its platform identity.
    async fn find(
        &mut self,
        platform: &Platform,
        account_id: &str,
    ) -> Result<Option<Account>, RepositoryError>;

    /// Lists accounts matching the filter.
    async fn list(&mut self, filter: AccountFilter) -> Result<Vec<Account>, RepositoryError>;

    /// Inserts an account, or replaces the existing row with the same
    /// `(platform, account_id)` identity.
    async fn upsert(&mut self, account: Account) -> Result<Account, RepositoryError>;

    /// Records the outcome of a cookie validation, stamping
    /// `last_check_time`.
    async fn update_status(
        &mut self,
        clock: &dyn Clock,
        id: Ulid,
        status: AccountStatus,
    ) -> Result<Account, RepositoryError>;

    /// Replaces the stored cookie bundle path.
    async fn update_cookie_file(
        &mut self,
        id: Ulid,
        cookie_file: &Utf8Path,
    ) -> Result<Account, RepositoryError>;

    /// Accounts that are candidates for message monitoring.
    async fn monitorable(&mut self) -> Result<Vec<Account>, RepositoryError>;
}
