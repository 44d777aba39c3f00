// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! Persistence contracts for tabfleet.
//!
//! The SQL engine behind these traits is an external collaborator: the core
//! and the HTTP surface only ever talk to the repository traits defined here,
//! handed out per unit of work by a [`RepositoryFactory`]. The shipped
//! implementation lives in `tabfleet-storage-mem`.

#![deny(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;

mod account;
mod clock;
mod message;
mod publish;

pub use self::{
    account::{AccountFilter, AccountRepository},
    clock::{BoxClock, Clock, ManualClock, SystemClock},
    message::{MessageRepository, StoredSync, ThreadFilter},
    publish::PublishRecordRepository,
};

/// An opaque failure inside a repository implementation.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The referenced entity does not exist.
    #[error("{entity} not found")]
    NotFound {
        /// Name of the missing entity, for diagnostics.
        entity: &'static str,
    },

    /// Any other backend failure.
    #[error("repository operation failed")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl RepositoryError {
    /// Wraps a backend error.
    pub fn internal<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Internal(Box::new(source))
    }
}

/// Offset/limit pagination for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Maximum number of rows to return.
    pub limit: usize,
    /// Rows to skip.
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    /// Creates a pagination window.
    #[must_use]
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }
}

/// Access to the sub-repositories of one unit of work.
pub trait RepositoryAccess: Send {
    /// The account table.
    fn account(&mut self) -> Box<dyn AccountRepository + '_>;

    /// The publish-record store.
    fn publish_record(&mut self) -> Box<dyn PublishRecordRepository + '_>;

    /// The message store (threads, messages, sync bookkeeping).
    fn message(&mut self) -> Box<dyn MessageRepository + '_>;
}

/// One unit of work against the store.
#[async_trait]
pub trait Repository: RepositoryAccess {
    /// Commits the unit of work.
    async fn save(self: Box<Self>) -> Result<(), RepositoryError>;
}

/// A boxed unit of work.
pub type BoxRepository = Box<dyn Repository>;

/// Hands out repositories, one per unit of work.
#[async_trait]
pub trait RepositoryFactory: Send + Sync {
    /// Creates a fresh repository.
    async fn create(&self) -> Result<BoxRepository, RepositoryError>;
}

/// A shared repository factory.
pub type BoxRepositoryFactory = Arc<dyn RepositoryFactory>;
