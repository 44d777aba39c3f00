// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use async_trait::async_trait;
use tabfleet_data_model::{
    Message, MessageStatistics, MessageThread, Platform, SyncedThread,
};
use ulid::Ulid;

use crate::{Clock, Pagination, RepositoryError};

/// Filter for thread and message queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadFilter {
    platform: Option<Platform>,
    account_id: Option<String>,
}

impl ThreadFilter {
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

    /// Restricts to one monitored account.
    #[must_use]
    pub fn for_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// The platform restriction, if any.
    #[must_use]
    pub fn platform(&self) -> Option<&Platform> {
        self.platform.as_ref()
    }

    /// The account restriction, if any.
    #[must_use]
    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref()
    }
}

/// What a persisted sync changed in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoredSync {
    /// Threads touched by the sync.
    pub threads: u64,
    /// Messages that were new to the store.
    pub new_messages: u64,
    /// Threads whose content changed.
    pub updated_threads: u64,
}

/// The message store: threads, messages and sync bookkeeping.
#[async_trait]
pub trait MessageRepository: Send {
    /// Persists the threads reported by one account sync.
    ///
    /// Messages are deduplicated on `(thread, platform_message_id)`; inbound
    /// messages enter the store unread.
    async fn store_sync(
        &mut self,
        clock: &dyn Clock,
        platform: &Platform,
        account_id: &str,
        threads: &[SyncedThread],
    ) -> Result<StoredSync, RepositoryError>;

    /// Lists threads matching the filter, most recently active first.
    async fn list_threads(
        &mut self,
        filter: ThreadFilter,
        pagination: Pagination,
    ) -> Result<Vec<MessageThread>, RepositoryError>;

    /// Lists the messages of one thread, oldest first.
    async fn thread_messages(
        &mut self,
        thread_id: Ulid,
        pagination: Pagination,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// Marks messages of a thread as read.
    ///
    /// With `message_ids` absent, the whole thread is marked. Returns the
    /// number of messages that changed.
    async fn mark_read(
        &mut self,
        thread_id: Ulid,
        message_ids: Option<&[Ulid]>,
    ) -> Result<u64, RepositoryError>;

    /// Searches message content for a keyword.
    async fn search(
        &mut self,
        filter: ThreadFilter,
        keyword: &str,
        pagination: Pagination,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// Aggregate statistics over the store.
    async fn statistics(
        &mut self,
        filter: ThreadFilter,
    ) -> Result<MessageStatistics, RepositoryError>;

    /// Unread inbound messages matching the filter.
    async fn unread_count(&mut self, filter: ThreadFilter) -> Result<u64, RepositoryError>;
}
