// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use figment::Figment;
use tracing::error;

use crate::config::AppConfig;

#[derive(Parser, Debug)]
pub(super) struct Options {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Parser, Debug)]
enum Subcommand {
    /// Validates the configuration without starting anything.
    Check,
    /// Prints the effective configuration as JSON.
    Dump,
}

impl Options {
    #[tracing::instrument(name = "cli.config.run", skip_all)]
    pub async fn run(self, figment: &Figment) -> anyhow::Result<ExitCode> {
        let config = match AppConfig::extract(figment) {
            Ok(config) => config,
            Err(e) => {
                error!("configuration is invalid: {e}");
                return Ok(ExitCode::FAILURE);
            }
        };

        match self.subcommand {
            Subcommand::Check => {
                if config.platforms.is_empty() {
                    error!("no platforms configured; the service would start empty");
                    return Ok(ExitCode::FAILURE);
                }
                println!("Configuration is valid ({} platforms).", config.platforms.len());
                Ok(ExitCode::SUCCESS)
            }
            Subcommand::Dump => {
                let rendered = serde_json::to_string_pretty(&config)
                    .context("failed to render configuration")?;
                println!("{rendered}");
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}
