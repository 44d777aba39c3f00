// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The plugin registry.
//!
//! Plugins are registered once at startup, in the fixed kind order
//! upload → login → validate → message, and the registry is immutable from
//! then on. One plugin failing to construct must not abort the rest: the
//! failure is logged and the slot skipped. A duplicate `(kind, platform)`
//! pair is a fatal configuration error.

use std::sync::Arc;

use indexmap::IndexMap;
use tabfleet_data_model::{Platform, PluginDescriptor, PluginKind};
use thiserror::Error;

use crate::{
    error::CoreError,
    plugin::{LoginPlugin, LoginProcessor, MessagePlugin, UploadPlugin, ValidatePlugin},
};

/// Fatal registry configuration errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two plugins claimed the same `(kind, platform)` pair.
    #[error("duplicate plugin registration for {kind}/{platform}")]
    Duplicate {
        /// The contested capability family.
        kind: PluginKind,
        /// The contested platform.
        platform: Platform,
    },
}

/// Typed lookup of platform plugins by `(kind, platform)`.
#[derive(Default)]
pub struct PluginRegistry {
    uploads: IndexMap<Platform, Arc<dyn UploadPlugin>>,
    logins: IndexMap<Platform, Arc<dyn LoginPlugin>>,
    login_processors: IndexMap<Platform, Arc<dyn LoginProcessor>>,
    validators: IndexMap<Platform, Arc<dyn ValidatePlugin>>,
    messages: IndexMap<Platform, Arc<dyn MessagePlugin>>,
}

impl PluginRegistry {
    /// Starts collecting plugins for registration.
    #[must_use]
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::default()
    }

    /// The upload plugin for a platform.
    #[must_use]
    pub fn upload(&self, platform: &Platform) -> Option<Arc<dyn UploadPlugin>> {
        self.uploads.get(platform).cloned()
    }

    /// The login plugin for a platform.
    #[must_use]
    pub fn login(&self, platform: &Platform) -> Option<Arc<dyn LoginPlugin>> {
        self.logins.get(platform).cloned()
    }

    /// The login processor for a platform.
    #[must_use]
    pub fn login_processor(&self, platform: &Platform) -> Option<Arc<dyn LoginProcessor>> {
        self.login_processors.get(platform).cloned()
    }

    /// The validate plugin for a platform.
    #[must_use]
    pub fn validate(&self, platform: &Platform) -> Option<Arc<dyn ValidatePlugin>> {
        self.validators.get(platform).cloned()
    }

    /// The message plugin for a platform.
    #[must_use]
    pub fn message(&self, platform: &Platform) -> Option<Arc<dyn MessagePlugin>> {
        self.messages.get(platform).cloned()
    }

    /// Whether a plugin is registered for the pair.
    #[must_use]
    pub fn supports(&self, kind: PluginKind, platform: &Platform) -> bool {
        match kind {
            PluginKind::Upload => self.uploads.contains_key(platform),
            PluginKind::Login => self.logins.contains_key(platform),
            PluginKind::Validate => self.validators.contains_key(platform),
            PluginKind::Message => self.messages.contains_key(platform),
        }
    }

    /// Platforms with a plugin of the given kind, or with any plugin at all.
    #[must_use]
    pub fn list_platforms(&self, kind: Option<PluginKind>) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = match kind {
            Some(PluginKind::Upload) => self.uploads.keys().cloned().collect(),
            Some(PluginKind::Login) => self.logins.keys().cloned().collect(),
            Some(PluginKind::Validate) => self.validators.keys().cloned().collect(),
            Some(PluginKind::Message) => self.messages.keys().cloned().collect(),
            None => {
                let mut all: Vec<Platform> = Vec::new();
                for kind in PluginKind::REGISTRATION_ORDER {
                    all.extend(self.list_platforms(Some(kind)));
                }
                all.sort();
                all
            }
        };
        platforms.dedup();
        platforms
    }

    /// Descriptors of every plugin of one kind, in registration order.
    #[must_use]
    pub fn get_by_kind(&self, kind: PluginKind) -> Vec<PluginDescriptor> {
        match kind {
            PluginKind::Upload => self.uploads.values().map(|p| p.descriptor()).collect(),
            PluginKind::Login => self.logins.values().map(|p| p.descriptor()).collect(),
            PluginKind::Validate => self.validators.values().map(|p| p.descriptor()).collect(),
            PluginKind::Message => self.messages.values().map(|p| p.descriptor()).collect(),
        }
    }

    /// Descriptors of every registered plugin, in registration order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        PluginKind::REGISTRATION_ORDER
            .into_iter()
            .flat_map(|kind| self.get_by_kind(kind))
            .collect()
    }
}

enum Slot<T> {
    Ready(T),
    Skipped,
}

fn collect<T>(kind: PluginKind, entry: Result<T, CoreError>) -> Slot<T> {
    match entry {
        Ok(plugin) => Slot::Ready(plugin),
        Err(e) => {
            // A broken plugin must not take the rest of the startup down.
            tracing::error!(
                error = &e as &dyn std::error::Error,
                plugin.kind = %kind,
                "plugin registration failed, skipping",
            );
            Slot::Skipped
        }
    }
}

/// Collects plugin construction results and builds the registry.
#[derive(Default)]
pub struct PluginRegistryBuilder {
    uploads: Vec<Slot<Arc<dyn UploadPlugin>>>,
    logins: Vec<Slot<Arc<dyn LoginPlugin>>>,
    login_processors: Vec<Slot<Arc<dyn LoginProcessor>>>,
    validators: Vec<Slot<Arc<dyn ValidatePlugin>>>,
    messages: Vec<Slot<Arc<dyn MessagePlugin>>>,
}

impl PluginRegistryBuilder {
    /// Adds an upload plugin construction result.
    #[must_use]
    pub fn upload(mut self, entry: Result<Arc<dyn UploadPlugin>, CoreError>) -> Self {
        self.uploads.push(collect(PluginKind::Upload, entry));
        self
    }

    /// Adds a login plugin construction result.
    #[must_use]
    pub fn login(mut self, entry: Result<Arc<dyn LoginPlugin>, CoreError>) -> Self {
        self.logins.push(collect(PluginKind::Login, entry));
        self
    }

    /// Adds a login processor construction result.
    #[must_use]
    pub fn login_processor(mut self, entry: Result<Arc<dyn LoginProcessor>, CoreError>) -> Self {
        self.login_processors
            .push(collect(PluginKind::Login, entry));
        self
    }

    /// Adds a validate plugin construction result.
    #[must_use]
    pub fn validate(mut self, entry: Result<Arc<dyn ValidatePlugin>, CoreError>) -> Self {
        self.validators.push(collect(PluginKind::Validate, entry));
        self
    }

    /// Adds a message plugin construction result.
    #[must_use]
    pub fn message(mut self, entry: Result<Arc<dyn MessagePlugin>, CoreError>) -> Self {
        self.messages.push(collect(PluginKind::Message, entry));
        self
    }

    /// Registers everything in the fixed kind order and seals the registry.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Duplicate`] when two plugins claim the same
    /// `(kind, platform)` pair.
    pub fn build(self) -> Result<PluginRegistry, RegistryError> {
        fn insert<T>(
            kind: PluginKind,
            map: &mut IndexMap<Platform, T>,
            platform: Platform,
            plugin: T,
        ) -> Result<(), RegistryError> {
            if map.contains_key(&platform) {
                return Err(RegistryError::Duplicate { kind, platform });
            }
            tracing::info!(plugin.kind = %kind, plugin.platform = %platform, "plugin registered");
            map.insert(platform, plugin);
            Ok(())
        }

        let mut registry = PluginRegistry::default();

        for slot in self.uploads {
            if let Slot::Ready(plugin) = slot {
                let platform = plugin.descriptor().platform;
                insert(PluginKind::Upload, &mut registry.uploads, platform, plugin)?;
            }
        }
        for slot in self.logins {
            if let Slot::Ready(plugin) = slot {
                let platform = plugin.descriptor().platform;
                insert(PluginKind::Login, &mut registry.logins, platform, plugin)?;
            }
        }
        for slot in self.login_processors {
            if let Slot::Ready(plugin) = slot {
                let platform = plugin.descriptor().platform;
                insert(
                    PluginKind::Login,
                    &mut registry.login_processors,
                    platform,
                    plugin,
                )?;
            }
        }
        for slot in self.validators {
            if let Slot::Ready(plugin) = slot {
                let platform = plugin.descriptor().platform;
                insert(
                    PluginKind::Validate,
                    &mut registry.validators,
                    platform,
                    plugin,
                )?;
            }
        }
        for slot in self.messages {
            if let Slot::Ready(plugin) = slot {
                let platform = plugin.descriptor().platform;
                insert(PluginKind::Message, &mut registry.messages, platform, plugin)?;
            }
        }

        Ok(registry)
    }
}
