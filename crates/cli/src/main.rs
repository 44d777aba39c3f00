// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The `tabfleet` binary.

use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;

mod commands;
mod config;
mod telemetry;

/// Multi-account social-media automation over an external browser bridge.
#[derive(Parser, Debug)]
#[command(name = "tabfleet", version)]
struct Options {
    /// Path to the configuration file.
    #[clap(long, short, global = true, default_value = "tabfleet.yaml")]
    config: Utf8PathBuf,

    #[command(subcommand)]
    command: commands::Subcommand,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    telemetry::init();

    let options = Options::parse();
    let figment = config::figment(&options.config);
    options.command.run(&figment).await
}
