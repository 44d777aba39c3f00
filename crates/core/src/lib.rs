// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The tabfleet automation orchestration core.
//!
//! Five cooperating components over two external contracts:
//!
//! - [`registry::PluginRegistry`]: typed plugin lookup by `(kind, platform)`
//! - [`custodian::MessageTabCustodian`]: long-lived per-account message
//!   tabs with health monitoring and repair
//! - [`scheduler::SyncScheduler`]: periodic, concurrency-bounded,
//!   backoff-aware message sync
//! - [`login::LoginCoordinator`]: async QR logins with background
//!   completion
//! - [`upload::UploadPipeline`]: the persisted upload state machine
//! - [`monitor::MonitoringOrchestrator`]: the sync-then-listen workflow
//!
//! The browser ([`broker::TabBroker`]) and the stores
//! (`tabfleet_storage`) are external collaborators behind contracts.
//! [`Core::init`] wires everything together; [`Core::shutdown`] is the
//! graceful teardown, bounded at thirty seconds.

#![deny(missing_docs)]

pub mod broker;
pub mod custodian;
pub mod error;
pub mod login;
pub mod monitor;
pub mod plugin;
pub mod registry;
pub mod scheduler;
pub mod sync;
pub mod testing;
pub mod upload;

use std::{sync::Arc, time::Duration};

use tabfleet_storage::{BoxClock, BoxRepositoryFactory};
use tokio_util::sync::CancellationToken;

use crate::{
    broker::TabBroker,
    custodian::MessageTabCustodian,
    login::LoginCoordinator,
    monitor::{MonitoringConfig, MonitoringOrchestrator},
    registry::PluginRegistry,
    scheduler::{SchedulerConfig, SyncFn, SyncScheduler},
    sync::SyncEngine,
    upload::UploadPipeline,
};

/// How long [`Core::shutdown`] waits for background work to drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything [`Core::init`] needs.
pub struct CoreOptions {
    /// The external browser abstraction.
    pub broker: Arc<dyn TabBroker>,
    /// The sealed plugin registry.
    pub registry: Arc<PluginRegistry>,
    /// The persistence contracts.
    pub repos: BoxRepositoryFactory,
    /// The timestamp source.
    pub clock: BoxClock,
    /// Scheduler tunables.
    pub scheduler: SchedulerConfig,
    /// Monitoring tunables.
    pub monitoring: MonitoringConfig,
}

/// The wired orchestration core.
pub struct Core {
    /// The sealed plugin registry.
    pub registry: Arc<PluginRegistry>,
    /// The external browser abstraction.
    pub broker: Arc<dyn TabBroker>,
    /// The persistence contracts.
    pub repos: BoxRepositoryFactory,
    /// The timestamp source.
    pub clock: BoxClock,
    /// Message-tab lifecycle management.
    pub custodian: Arc<MessageTabCustodian>,
    /// One-account sync, end to end.
    pub engine: Arc<SyncEngine>,
    /// Periodic sync scheduling.
    pub scheduler: Arc<SyncScheduler>,
    /// QR logins.
    pub login: Arc<LoginCoordinator>,
    /// Uploads.
    pub upload: Arc<UploadPipeline>,
    /// The sync-then-listen workflow.
    pub monitor: Arc<MonitoringOrchestrator>,
    cancel: CancellationToken,
}

impl Core {
    /// Wires the components together. Nothing is scheduled until
    /// [`Self::start`].
    #[must_use]
    pub fn init(options: CoreOptions) -> Arc<Self> {
        let CoreOptions {
            broker,
            registry,
            repos,
            clock,
            scheduler: scheduler_config,
            monitoring: monitoring_config,
        } = options;

        let cancel = CancellationToken::new();

        let custodian = MessageTabCustodian::new(
            broker.clone(),
            registry.clone(),
            clock.clone(),
            cancel.child_token(),
        );
        let engine = SyncEngine::new(
            registry.clone(),
            custodian.clone(),
            repos.clone(),
            clock.clone(),
        );

        let sync_fn: SyncFn = {
            let engine = engine.clone();
            Arc::new(move |platform, account_id, tab_id, options| {
                let engine = engine.clone();
                Box::pin(async move {
                    engine
                        .sync_with_tab(&platform, &account_id, tab_id, options)
                        .await
                })
            })
        };
        let scheduler = SyncScheduler::new(scheduler_config, custodian.clone(), sync_fn, clock.clone());

        let login = LoginCoordinator::new(
            registry.clone(),
            broker.clone(),
            repos.clone(),
            clock.clone(),
            cancel.child_token(),
        );
        let upload = UploadPipeline::new(registry.clone(), broker.clone(), repos.clone());
        let monitor = MonitoringOrchestrator::new(
            monitoring_config,
            registry.clone(),
            custodian.clone(),
            engine.clone(),
            scheduler.clone(),
            repos.clone(),
            clock.clone(),
        );

        Arc::new(Self {
            registry,
            broker,
            repos,
            clock,
            custodian,
            engine,
            scheduler,
            login,
            upload,
            monitor,
            cancel,
        })
    }

    /// Arms the background workers: the scheduler's master tick and the
    /// login janitor.
    pub fn start(self: &Arc<Self>) {
        self.scheduler.start();
        self.login.spawn_janitor();
        tracing::info!("orchestration core started");
    }

    /// Graceful teardown: stop scheduling, drain in-flight work, stop every
    /// monitor and retire every tab. Bounded at thirty seconds.
    pub async fn shutdown(self: &Arc<Self>) {
        self.scheduler.stop().await;
        self.monitor.stop_all().await;
        self.cancel.cancel();

        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            self.login.shutdown().await;
            self.custodian.shutdown().await;
        })
        .await;
        if drained.is_err() {
            tracing::warn!("core shutdown timed out with background work still in flight");
        }
        tracing::info!("orchestration core stopped");
    }
}
