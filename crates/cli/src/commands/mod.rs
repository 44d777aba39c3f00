// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use std::process::ExitCode;

use clap::Parser;
use figment::Figment;

mod config;
mod serve;

/// The commands of the `tabfleet` binary.
#[derive(Parser, Debug)]
pub(super) enum Subcommand {
    /// Runs the automation service.
    Serve(serve::Options),

    /// Inspects the configuration.
    Config(config::Options),
}

impl Subcommand {
    pub async fn run(self, figment: &Figment) -> anyhow::Result<ExitCode> {
        match self {
            Self::Serve(options) => options.run(figment).await,
            Self::Config(options) => options.run(figment).await,
        }
    }
}
