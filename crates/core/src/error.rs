// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! Error types shared across the core crate.

use std::{fmt, time::Duration};

use tabfleet_data_model::{Platform, PluginKind};
use tabfleet_storage::RepositoryError;
use thiserror::Error;

use crate::broker::BrokerError;

/// The operation phase a timeout is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// A per-account message sync overran its budget.
    Sync,
    /// The publish wait after an upload overran its budget.
    PublishWait,
    /// A freshly created message tab never became ready.
    Readiness,
    /// A page script did not resolve in time.
    Script,
}

impl TimeoutPhase {
    /// The stable tag reported to callers.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync_timeout",
            Self::PublishWait => "publish_wait_timeout",
            Self::Readiness => "readiness_timeout",
            Self::Script => "script_timeout",
        }
    }
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures surfaced by the orchestration core.
///
/// Individual plugin or tab failures never panic the core; they are isolated
/// to the affected task or job and reported through this type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing or malformed inputs.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("{entity} not found")]
    NotFound {
        /// Name of the missing entity.
        entity: &'static str,
    },

    /// No plugin is registered for the `(kind, platform)` pair.
    #[error("no {kind} plugin registered for platform {platform}")]
    PluginUnavailable {
        /// The requested capability family.
        kind: PluginKind,
        /// The requested platform.
        platform: Platform,
    },

    /// Cookie validation rejected the account's session.
    #[error("session cookie rejected for account {account}")]
    SessionInvalid {
        /// The canonical account key.
        account: String,
    },

    /// A message tab failed its health predicate beyond repair.
    #[error("message tab unhealthy: {reason}")]
    TabUnhealthy {
        /// Which health clause failed.
        reason: String,
    },

    /// A bounded wait elapsed.
    #[error("{phase} after {timeout:?}")]
    Timeout {
        /// The phase the timeout is attributed to.
        phase: TimeoutPhase,
        /// The elapsed budget.
        timeout: Duration,
    },

    /// The tab broker refused or failed an operation.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The persistence layer failed.
    #[error(transparent)]
    Storage(#[from] RepositoryError),

    /// Any unclassified plugin or environment failure.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl CoreError {
    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
