// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The sync engine: one account pull, end to end.
//!
//! The engine borrows the account's message tab from the custodian, lets the
//! platform plugin pull the inbox, persists what came back and reports the
//! store's view of the changes. Batch syncs fan the same path out with
//! bounded concurrency and a per-account timeout.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use serde::Serialize;
use tabfleet_data_model::{AccountRef, Platform, SendReport, SyncReport, TabId};
use tabfleet_storage::{BoxClock, BoxRepositoryFactory, Repository as _, RepositoryAccess};

use crate::{
    custodian::MessageTabCustodian,
    error::{CoreError, TimeoutPhase},
    plugin::{SendParams, SyncParams},
    registry::PluginRegistry,
};

/// Options for one account sync.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Pull full history instead of the recent window.
    pub full_sync: bool,
}

/// Options for a batched sync across accounts.
#[derive(Debug, Clone, Copy)]
pub struct BatchSyncOptions {
    /// Accounts syncing at the same time.
    pub concurrency: usize,
    /// Budget per account.
    pub timeout: Duration,
    /// Pull full history instead of the recent window.
    pub full_sync: bool,
}

impl Default for BatchSyncOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            timeout: Duration::from_secs(30),
            full_sync: false,
        }
    }
}

/// One account's slice of a batch sync.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSyncOutcome {
    /// Platform of the account.
    pub platform: Platform,
    /// The synced account.
    pub account_id: String,
    /// Whether the sync completed.
    pub success: bool,
    /// The sync report, on success.
    pub report: Option<SyncReport>,
    /// Failure detail, on failure.
    pub error: Option<String>,
}

/// Aggregate outcome of a batch sync.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSyncReport {
    /// Per-account outcomes, in request order.
    pub results: Vec<AccountSyncOutcome>,
    /// New messages across all successful accounts.
    pub total_new_messages: u64,
}

/// Pulls direct messages for accounts and persists them.
pub struct SyncEngine {
    registry: Arc<PluginRegistry>,
    custodian: Arc<MessageTabCustodian>,
    repos: BoxRepositoryFactory,
    clock: BoxClock,
}

impl SyncEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new(
        registry: Arc<PluginRegistry>,
        custodian: Arc<MessageTabCustodian>,
        repos: BoxRepositoryFactory,
        clock: BoxClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            custodian,
            repos,
            clock,
        })
    }

    /// Syncs one account, resolving the tab through the custodian.
    #[tracing::instrument(
        name = "sync.platform_messages",
        skip_all,
        fields(platform = %platform, account_id = account_id),
    )]
    pub async fn sync_platform_messages(
        &self,
        platform: &Platform,
        account_id: &str,
        cookie_file: &camino::Utf8Path,
        options: SyncOptions,
    ) -> Result<SyncReport, CoreError> {
        let tab_id = self
            .custodian
            .ensure_message_tab(platform, account_id, cookie_file)
            .await?;
        self.sync_with_tab(platform, account_id, tab_id, options)
            .await
    }

    /// Syncs one account against an already-ensured tab.
    pub async fn sync_with_tab(
        &self,
        platform: &Platform,
        account_id: &str,
        tab_id: TabId,
        options: SyncOptions,
    ) -> Result<SyncReport, CoreError> {
        let plugin =
            self.registry
                .message(platform)
                .ok_or_else(|| CoreError::PluginUnavailable {
                    kind: tabfleet_data_model::PluginKind::Message,
                    platform: platform.clone(),
                })?;

        let batch = plugin
            .sync_messages(&SyncParams {
                platform: platform.clone(),
                account_id: account_id.to_owned(),
                tab_id,
                full_sync: options.full_sync,
            })
            .await?;

        if !batch.success {
            return Err(CoreError::Transient(anyhow::anyhow!(
                "platform reported sync failure: {}",
                batch.errors.join("; ")
            )));
        }

        let mut repo = self.repos.create().await?;
        let stored = repo
            .message()
            .store_sync(self.clock.as_ref(), platform, account_id, &batch.threads)
            .await?;
        repo.save().await?;

        Ok(SyncReport {
            threads: stored.threads,
            new_messages: stored.new_messages,
            updated_threads: stored.updated_threads,
            errors: batch.errors,
            sync_time: batch.sync_time,
        })
    }

    /// Sends one direct message through a platform plugin.
    pub async fn send_message(
        &self,
        platform: &Platform,
        params: SendParams,
    ) -> Result<SendReport, CoreError> {
        let plugin =
            self.registry
                .message(platform)
                .ok_or_else(|| CoreError::PluginUnavailable {
                    kind: tabfleet_data_model::PluginKind::Message,
                    platform: platform.clone(),
                })?;
        plugin.send_message(&params).await
    }

    /// Syncs several accounts with bounded concurrency and a per-account
    /// timeout. A failed account never aborts the rest.
    #[tracing::instrument(name = "sync.batch", skip_all, fields(accounts = accounts.len()))]
    pub async fn batch_sync(
        &self,
        accounts: &[AccountRef],
        options: BatchSyncOptions,
    ) -> BatchSyncReport {
        let sync_options = SyncOptions {
            full_sync: options.full_sync,
        };

        let results: Vec<AccountSyncOutcome> = futures_util::stream::iter(accounts.iter().cloned())
            .map(|account| async move {
                let outcome = tokio::time::timeout(
                    options.timeout,
                    self.sync_platform_messages(
                        &account.platform,
                        &account.account_id,
                        &account.cookie_file,
                        sync_options,
                    ),
                )
                .await
                .unwrap_or(Err(CoreError::Timeout {
                    phase: TimeoutPhase::Sync,
                    timeout: options.timeout,
                }));

                match outcome {
                    Ok(report) => AccountSyncOutcome {
                        platform: account.platform,
                        account_id: account.account_id,
                        success: true,
                        report: Some(report),
                        error: None,
                    },
                    Err(e) => AccountSyncOutcome {
                        platform: account.platform,
                        account_id: account.account_id,
                        success: false,
                        report: None,
                        error: Some(e.to_string()),
                    },
                }
            })
            .buffered(options.concurrency.max(1))
            .collect()
            .await;

        let total_new_messages = results
            .iter()
            .filter_map(|r| r.report.as_ref())
            .map(|r| r.new_messages)
            .sum();

        BatchSyncReport {
            results,
            total_new_messages,
        }
    }
}
