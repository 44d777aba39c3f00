// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use figment::Figment;
use tabfleet_core::{
    broker::{http::HttpTabBroker, TabBroker},
    error::CoreError,
    plugin::scripted::{
        ScriptPack, ScriptedLoginPlugin, ScriptedLoginProcessor, ScriptedMessagePlugin,
        ScriptedUploadPlugin, ScriptedValidatePlugin, Scripts,
    },
    registry::PluginRegistry,
    Core, CoreOptions,
};
use tabfleet_data_model::Platform;
use tabfleet_handlers::{router, AppState, ServePaths};
use tabfleet_storage::{BoxClock, SystemClock};
use tabfleet_storage_mem::MemRepositoryFactory;
use tracing::{info, warn};

use crate::config::{AppConfig, PlatformConfig};

#[derive(Parser, Debug)]
pub(super) struct Options {
    /// Override the configured listen address.
    #[clap(long)]
    listen: Option<String>,
}

impl Options {
    #[tracing::instrument(name = "cli.serve.run", skip_all)]
    pub async fn run(self, figment: &Figment) -> anyhow::Result<ExitCode> {
        let config = AppConfig::extract(figment).context("failed to load configuration")?;

        for dir in [
            &config.paths.cookie_dir,
            &config.paths.video_dir,
            &config.paths.avatar_dir,
        ] {
            std::fs::create_dir_all(dir.as_std_path())
                .with_context(|| format!("failed to create {dir}"))?;
        }

        let broker: Arc<dyn TabBroker> = Arc::new(
            HttpTabBroker::new(config.bridge.base_url.clone())
                .context("failed to construct the browser-bridge client")?,
        );
        let clock: BoxClock = Arc::new(SystemClock);

        let registry = build_registry(
            &config,
            broker.clone(),
            clock.clone(),
            &config.paths.cookie_dir,
        )
        .context("plugin registry configuration is invalid")?;
        if config.platforms.is_empty() {
            warn!("no platforms configured; the service starts with an empty registry");
        }

        let core = Core::init(CoreOptions {
            broker,
            registry: Arc::new(registry),
            repos: Arc::new(MemRepositoryFactory::new()),
            clock,
            scheduler: config.scheduler.to_config(),
            monitoring: config.monitoring.to_config(),
        });
        core.start();

        let state = AppState {
            core: core.clone(),
            paths: ServePaths {
                cookie_dir: config.paths.cookie_dir.clone(),
                video_dir: config.paths.video_dir.clone(),
                avatar_dir: config.paths.avatar_dir.clone(),
            },
        };
        let app = router(state);

        let listen = self.listen.unwrap_or(config.http.listen);
        let listener = tokio::net::TcpListener::bind(&listen)
            .await
            .with_context(|| format!("failed to bind {listen}"))?;
        info!(%listen, "tabfleet listening");

        let status_logger = tokio::spawn(occasional_status_logger(core.clone()));

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server error")?;

        status_logger.abort();
        core.shutdown().await;

        Ok(ExitCode::SUCCESS)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for the shutdown signal");
    }
    info!("shutdown requested");
}

/// Logs scheduler and tab state every 30 seconds, as a lightweight way for
/// the operator to see what the fleet is doing without hitting the API.
async fn occasional_status_logger(core: Arc<Core>) {
    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;
        let scheduler = core.scheduler.status();
        let tabs = core.custodian.records().await.len();
        info!(
            name: "status",
            tasks = scheduler.total_tasks,
            running = scheduler.running_tasks,
            quarantined = scheduler.quarantined_tasks,
            message_tabs = tabs,
            "fleet status",
        );
    }
}

fn read_script(path: &Utf8Path) -> Result<String, CoreError> {
    std::fs::read_to_string(path.as_std_path())
        .map_err(|e| CoreError::validation(format!("script {path} unreadable: {e}")))
}

fn read_optional_script(path: Option<&Utf8PathBuf>) -> Result<Option<String>, CoreError> {
    path.map(|path| read_script(path)).transpose()
}

fn load_pack(config: &PlatformConfig) -> Result<Arc<ScriptPack>, CoreError> {
    let scripts = Scripts {
        readiness: read_optional_script(config.scripts.readiness.as_ref())?,
        sync: read_script(&config.scripts.sync)?,
        send: read_script(&config.scripts.send)?,
        monitor: read_script(&config.scripts.monitor)?,
        validate: read_script(&config.scripts.validate)?,
        login_start: read_script(&config.scripts.login_start)?,
        login_poll: read_script(&config.scripts.login_poll)?,
        login_cancel: read_optional_script(config.scripts.login_cancel.as_ref())?,
        upload_publish: read_script(&config.scripts.upload_publish)?,
        account_info: read_script(&config.scripts.account_info)?,
    };
    Ok(Arc::new(ScriptPack {
        platform: Platform::new(config.platform.clone()),
        display_name: config
            .display_name
            .clone()
            .unwrap_or_else(|| config.platform.clone()),
        message_url: config.message_url.clone(),
        login_url: config.login_url.clone(),
        upload_url: config.upload_url.clone(),
        probe_url: config
            .probe_url
            .clone()
            .unwrap_or_else(|| config.message_url.clone()),
        file_input_selector: config.file_input_selector.clone(),
        scripts,
    }))
}

/// Registers the scripted plugin family for every configured platform.
///
/// A broken pack is skipped kind by kind (and logged there); a duplicate
/// platform tag is fatal.
fn build_registry(
    config: &AppConfig,
    broker: Arc<dyn TabBroker>,
    clock: BoxClock,
    cookie_dir: &Utf8Path,
) -> Result<PluginRegistry, tabfleet_core::registry::RegistryError> {
    let mut builder = PluginRegistry::builder();
    for platform in &config.platforms {
        match load_pack(platform) {
            Ok(pack) => {
                builder = builder
                    .upload(Ok(Arc::new(ScriptedUploadPlugin::new(
                        broker.clone(),
                        pack.clone(),
                    ))))
                    .login(Ok(Arc::new(ScriptedLoginPlugin::new(
                        broker.clone(),
                        pack.clone(),
                    ))))
                    .login_processor(Ok(Arc::new(ScriptedLoginProcessor::new(
                        broker.clone(),
                        pack.clone(),
                        cookie_dir.to_owned(),
                        clock.clone(),
                    ))))
                    .validate(Ok(Arc::new(ScriptedValidatePlugin::new(
                        broker.clone(),
                        pack.clone(),
                    ))))
                    .message(Ok(Arc::new(ScriptedMessagePlugin::new(
                        broker.clone(),
                        pack.clone(),
                        clock.clone(),
                    ))));
            }
            Err(e) => {
                let message = e.to_string();
                builder = builder
                    .upload(Err(CoreError::validation(message.clone())))
                    .login(Err(CoreError::validation(message.clone())))
                    .login_processor(Err(CoreError::validation(message.clone())))
                    .validate(Err(CoreError::validation(message.clone())))
                    .message(Err(CoreError::validation(message)));
            }
        }
    }
    builder.build()
}
