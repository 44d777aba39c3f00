// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Platform;

/// The capability family of a platform plugin.
///
/// The capability set of a plugin is fully determined by its kind; the
/// registry keys plugins by `(kind, platform)` and that pair is unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    /// Drives an end-to-end video upload on one platform.
    Upload,
    /// Starts and cancels QR-code logins.
    Login,
    /// Checks whether a stored cookie bundle is still accepted.
    Validate,
    /// Syncs and sends direct messages, and installs inbox listeners.
    Message,
}

impl PluginKind {
    /// The fixed order in which kinds are registered at startup.
    pub const REGISTRATION_ORDER: [Self; 4] =
        [Self::Upload, Self::Login, Self::Validate, Self::Message];

    /// The lowercase tag used in logs and wire payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Login => "login",
            Self::Validate => "validate",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one registered plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Capability family.
    pub kind: PluginKind,
    /// Platform the plugin drives.
    pub platform: Platform,
    /// Human-readable name for status output.
    pub display_name: String,
}

impl PluginDescriptor {
    /// Creates a descriptor.
    pub fn new(kind: PluginKind, platform: Platform, display_name: impl Into<String>) -> Self {
        Self {
            kind,
            platform,
            display_name: display_name.into(),
        }
    }
}

impl fmt::Display for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.platform)
    }
}
