// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The tab broker contract.
//!
//! The browser itself is an external collaborator: something else owns the
//! real tabs, navigates them, executes page scripts and streams file uploads.
//! The core only ever talks to this trait. [`http::HttpTabBroker`] is the
//! client for the external browser bridge; tests use the fake in
//! [`crate::testing`].

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tabfleet_data_model::{LockOwner, TabId, TabLock};
use thiserror::Error;
use url::Url;

/// Failures reported by the tab broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The tab is not known to the broker.
    #[error("tab {0} is not known to the broker")]
    UnknownTab(TabId),

    /// The tab's lock is held by another component.
    #[error("tab lock is held by {owner}")]
    LockHeld {
        /// The current lock holder.
        owner: LockOwner,
    },

    /// A page script raised or returned an error.
    #[error("page script failed: {0}")]
    Script(String),

    /// The bridge reported a failure.
    #[error("browser bridge error: {0}")]
    Bridge(String),

    /// The bridge could not be reached.
    #[error("browser bridge unreachable")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl BrokerError {
    /// Wraps a transport-level error.
    pub fn transport<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(source))
    }
}

/// Parameters for allocating a tab.
#[derive(Debug, Clone)]
pub struct CreateTabParams {
    /// The URL the tab opens on.
    pub url: Url,
    /// The component taking the tab's lock.
    pub owner: LockOwner,
    /// Whether the tab may run without a visible window.
    pub headless: bool,
    /// Cookie bundle the browser loads into the tab before navigating.
    pub cookie_file: Option<Utf8PathBuf>,
}

/// Outcome of a bounded wait for a tab's URL to change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlChange {
    /// The tab navigated; carries the new URL.
    Changed(String),
    /// The wait elapsed without a navigation.
    TimedOut,
}

/// The external browser abstraction.
///
/// Every method is a suspension point. A tab is usable by a component only
/// while that component holds the tab's lock; the broker enforces nothing
/// beyond reporting the lock, so components must not call scripts against
/// tabs they do not own.
#[async_trait]
pub trait TabBroker: Send + Sync {
    /// Creates a tab, taking its lock for `params.owner`.
    async fn create_tab(&self, params: CreateTabParams) -> Result<TabId, BrokerError>;

    /// Closes a tab and releases its lock.
    async fn close_tab(&self, tab: &TabId) -> Result<(), BrokerError>;

    /// Whether the broker knows the tab.
    async fn tab_exists(&self, tab: &TabId) -> bool;

    /// The tab's current lock, if any.
    async fn lock(&self, tab: &TabId) -> Result<Option<TabLock>, BrokerError>;

    /// Navigates the tab.
    async fn navigate(&self, tab: &TabId, url: &Url) -> Result<(), BrokerError>;

    /// The tab's current URL.
    async fn current_url(&self, tab: &TabId) -> Result<String, BrokerError>;

    /// Executes a page script, waiting at most `timeout` for it to resolve.
    async fn execute_script(
        &self,
        tab: &TabId,
        script: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, BrokerError>;

    /// Waits at most `timeout` for the tab to navigate away from its current
    /// URL.
    async fn wait_for_url_change(
        &self,
        tab: &TabId,
        timeout: Duration,
    ) -> Result<UrlChange, BrokerError>;

    /// Streams a local file into a file input of the page.
    async fn attach_file(
        &self,
        tab: &TabId,
        selector: &str,
        file: &Utf8Path,
    ) -> Result<(), BrokerError>;

    /// Exports the tab's origin cookies to a bundle on disk.
    async fn export_cookies(&self, tab: &TabId, dest: &Utf8Path) -> Result<(), BrokerError>;
}
