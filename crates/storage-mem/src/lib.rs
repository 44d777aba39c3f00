// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! In-memory implementation of the tabfleet storage contracts.
//!
//! One process-local state block behind a mutex; repositories are cheap
//! handles onto it. Writes apply immediately, so `save` is a no-op commit.
//! This is the store the server runs with by default and the fixture every
//! test uses.

#![deny(missing_docs)]

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use indexmap::IndexMap;
use tabfleet_data_model::{Account, Message, MessageThread, PublishRecord};
use tabfleet_storage::{
    AccountRepository, BoxRepository, MessageRepository, PublishRecordRepository, Repository,
    RepositoryAccess, RepositoryError, RepositoryFactory,
};
use ulid::Ulid;

mod account;
mod message;
mod publish;

pub use self::{
    account::MemAccountRepository, message::MemMessageRepository,
    publish::MemPublishRecordRepository,
};

/// The whole store, behind one mutex.
#[derive(Debug, Default)]
pub(crate) struct MemState {
    pub(crate) accounts: IndexMap<Ulid, Account>,
    pub(crate) publish_records: IndexMap<Ulid, PublishRecord>,
    pub(crate) threads: IndexMap<Ulid, MessageThread>,
    pub(crate) messages: IndexMap<Ulid, Message>,
}

pub(crate) type SharedState = Arc<Mutex<MemState>>;

#[derive(Debug, thiserror::Error)]
#[error("store state mutex poisoned")]
struct StatePoisoned;

/// Locks the shared state, mapping poisoning onto a repository error.
pub(crate) fn lock_state(
    state: &SharedState,
) -> Result<MutexGuard<'_, MemState>, RepositoryError> {
    state.lock().map_err(|_| RepositoryError::internal(StatePoisoned))
}

/// Hands out [`MemRepository`] handles over one shared state block.
#[derive(Debug, Clone, Default)]
pub struct MemRepositoryFactory {
    state: SharedState,
}

impl MemRepositoryFactory {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RepositoryFactory for MemRepositoryFactory {
    async fn create(&self) -> Result<BoxRepository, RepositoryError> {
        Ok(Box::new(MemRepository {
            state: self.state.clone(),
        }))
    }
}

/// One unit of work against the in-memory store.
pub struct MemRepository {
    state: SharedState,
}

impl RepositoryAccess for MemRepository {
    fn account(&mut self) -> Box<dyn AccountRepository + '_> {
        Box::new(MemAccountRepository::new(self.state.clone()))
    }

    fn publish_record(&mut self) -> Box<dyn PublishRecordRepository + '_> {
        Box::new(MemPublishRecordRepository::new(self.state.clone()))
    }

    fn message(&mut self) -> Box<dyn MessageRepository + '_> {
        Box::new(MemMessageRepository::new(self.state.clone()))
    }
}

#[async_trait]
impl Repository for MemRepository {
    async fn save(self: Box<Self>) -> Result<(), RepositoryError> {
        // Mutations applied immediately; nothing to flush.
        Ok(())
    }
}
