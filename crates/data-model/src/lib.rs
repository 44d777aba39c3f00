// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! Data types shared across the tabfleet workspace.
//!
//! Everything in this crate is plain data: no I/O, no locking, no behaviour
//! beyond constructors and conversions. The orchestration core, the storage
//! contracts and the HTTP surface all exchange these types.

#![deny(missing_docs)]

mod account;
mod login;
mod message;
mod platform;
mod plugin;
mod tab;
mod task;
mod upload;

pub use self::{
    account::{account_key, Account, AccountInfo, AccountRef, AccountStatus},
    login::{LoginRecord, LoginStatus},
    message::{
        Message, MessageDirection, MessageKind, MessageStatistics, MessageThread,
        MonitorDenyReason, PlatformMessageStats, SendReport, SyncReport, SyncedMessage,
        SyncedThread,
    },
    platform::Platform,
    plugin::{PluginDescriptor, PluginKind},
    tab::{LockOwner, MessageTabRecord, TabId, TabLock},
    task::{SyncTask, TaskStatus},
    upload::{
        publish_status, NewPublishRecord, PublishAccountState, PublishRecord, PublishState,
        PublishStatusPatch, UploadOutcome, UploadRequest,
    },
};
