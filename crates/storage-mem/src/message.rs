// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! In-memory implementation of the message store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tabfleet_data_model::{
    Message, MessageDirection, MessageStatistics, MessageThread, Platform, PlatformMessageStats,
    SyncedThread,
};
use tabfleet_storage::{
    Clock, MessageRepository, Pagination, RepositoryError, StoredSync, ThreadFilter,
};
use ulid::Ulid;

use crate::{lock_state, MemState, SharedState};

/// An implementation of [`MessageRepository`] over the shared state block.
pub struct MemMessageRepository {
    state: SharedState,
}

impl MemMessageRepository {
    pub(crate) fn new(state: SharedState) -> Self {
        Self { state }
    }
}

fn thread_matches(filter: &ThreadFilter, thread: &MessageThread) -> bool {
    if filter.platform().is_some_and(|p| *p != thread.platform) {
        return false;
    }
    if filter
        .account_id()
        .is_some_and(|a| a != thread.account_id)
    {
        return false;
    }
    true
}

fn unread_of_thread(state: &MemState, thread_id: Ulid) -> u64 {
    state
        .messages
        .values()
        .filter(|m| {
            m.thread_id == thread_id && m.direction == MessageDirection::Inbound && !m.read
        })
        .count() as u64
}

#[async_trait]
impl MessageRepository for MemMessageRepository {
    #[tracing::instrument(
        name = "db.message.store_sync",
        skip_all,
        fields(platform = %platform, account_id = account_id, threads = threads.len()),
        err,
    )]
    async fn store_sync(
        &mut self,
        clock: &dyn Clock,
        platform: &Platform,
        account_id: &str,
        threads: &[SyncedThread],
    ) -> Result<StoredSync, RepositoryError> {
        let now = clock.now();
        let mut state = lock_state(&self.state)?;
        let mut stored = StoredSync {
            threads: threads.len() as u64,
            ..StoredSync::default()
        };

        for synced in threads {
            let existing = state
                .threads
                .values()
                .find(|t| {
                    t.platform == *platform
                        && t.account_id == account_id
                        && t.peer_id == synced.peer_id
                })
                .map(|t| t.id);

            let thread_id = match existing {
                Some(id) => id,
                None => {
                    let id = Ulid::new();
                    state.threads.insert(
                        id,
                        MessageThread {
                            id,
                            platform: platform.clone(),
                            account_id: account_id.to_owned(),
                            peer_id: synced.peer_id.clone(),
                            peer_name: synced.peer_name.clone(),
                            peer_avatar: synced.peer_avatar.clone(),
                            unread_count: 0,
                            last_message_at: None,
                            updated_at: now,
                        },
                    );
                    id
                }
            };

            let mut changed = false;
            for incoming in &synced.messages {
                let known = state.messages.values().any(|m| {
                    m.thread_id == thread_id
                        && m.platform_message_id == incoming.platform_message_id
                });
                if known {
                    continue;
                }
                let id = Ulid::new();
                state.messages.insert(
                    id,
                    Message {
                        id,
                        thread_id,
                        platform_message_id: incoming.platform_message_id.clone(),
                        direction: incoming.direction,
                        kind: incoming.kind,
                        content: incoming.content.clone(),
                        sent_at: incoming.sent_at,
                        read: incoming.direction == MessageDirection::Outbound,
                    },
                );
                stored.new_messages += 1;
                changed = true;
            }

            let unread = unread_of_thread(&state, thread_id);
            let last_message_at = state
                .messages
                .values()
                .filter(|m| m.thread_id == thread_id)
                .map(|m| m.sent_at)
                .max();
            let thread = state
                .threads
                .get_mut(&thread_id)
                .ok_or(RepositoryError::NotFound { entity: "thread" })?;
            thread.peer_name = synced.peer_name.clone();
            if synced.peer_avatar.is_some() {
                thread.peer_avatar = synced.peer_avatar.clone();
            }
            thread.unread_count = unread;
            thread.last_message_at = last_message_at;
            if changed {
                thread.updated_at = now;
                stored.updated_threads += 1;
            }
        }

        Ok(stored)
    }

    #[tracing::instrument(name = "db.message.list_threads", skip_all, err)]
    async fn list_threads(
        &mut self,
        filter: ThreadFilter,
        pagination: Pagination,
    ) -> Result<Vec<MessageThread>, RepositoryError> {
        let state = lock_state(&self.state)?;
        let mut threads: Vec<_> = state
            .threads
            .values()
            .filter(|t| thread_matches(&filter, t))
            .cloned()
            .collect();
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(threads
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .collect())
    }

    #[tracing::instrument(name = "db.message.thread_messages", skip_all, fields(thread.id = %thread_id), err)]
    async fn thread_messages(
        &mut self,
        thread_id: Ulid,
        pagination: Pagination,
    ) -> Result<Vec<Message>, RepositoryError> {
        let state = lock_state(&self.state)?;
        let mut messages: Vec<_> = state
            .messages
            .values()
            .filter(|m| m.thread_id == thread_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        Ok(messages
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .collect())
    }

    #[tracing::instrument(name = "db.message.mark_read", skip_all, fields(thread.id = %thread_id), err)]
    async fn mark_read(
        &mut self,
        thread_id: Ulid,
        message_ids: Option<&[Ulid]>,
    ) -> Result<u64, RepositoryError> {
        let mut state = lock_state(&self.state)?;
        let mut changed = 0;
        for message in state.messages.values_mut() {
            if message.thread_id != thread_id || message.read {
                continue;
            }
            if let Some(ids) = message_ids {
                if !ids.contains(&message.id) {
                    continue;
                }
            }
            message.read = true;
            changed += 1;
        }

        let unread = unread_of_thread(&state, thread_id);
        if let Some(thread) = state.threads.get_mut(&thread_id) {
            thread.unread_count = unread;
        }
        Ok(changed)
    }

    #[tracing::instrument(name = "db.message.search", skip_all, fields(keyword), err)]
    async fn search(
        &mut self,
        filter: ThreadFilter,
        keyword: &str,
        pagination: Pagination,
    ) -> Result<Vec<Message>, RepositoryError> {
        let state = lock_state(&self.state)?;
        let keyword = keyword.to_lowercase();
        let mut hits: Vec<_> = state
            .messages
            .values()
            .filter(|m| {
                let Some(thread) = state.threads.get(&m.thread_id) else {
                    return false;
                };
                thread_matches(&filter, thread) && m.content.to_lowercase().contains(&keyword)
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        Ok(hits
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .collect())
    }

    #[tracing::instrument(name = "db.message.statistics", skip_all, err)]
    async fn statistics(
        &mut self,
        filter: ThreadFilter,
    ) -> Result<MessageStatistics, RepositoryError> {
        let state = lock_state(&self.state)?;
        let mut stats = MessageStatistics::default();
        let mut by_platform: BTreeMap<Platform, PlatformMessageStats> = BTreeMap::new();

        for thread in state.threads.values() {
            if !thread_matches(&filter, thread) {
                continue;
            }
            let messages = state
                .messages
                .values()
                .filter(|m| m.thread_id == thread.id)
                .count() as u64;
            let unread = unread_of_thread(&state, thread.id);

            stats.total_threads += 1;
            stats.total_messages += messages;
            stats.unread_messages += unread;

            let slot = by_platform
                .entry(thread.platform.clone())
                .or_insert_with(|| PlatformMessageStats {
                    platform: thread.platform.clone(),
                    threads: 0,
                    messages: 0,
                    unread: 0,
                });
            slot.threads += 1;
            slot.messages += messages;
            slot.unread += unread;
        }

        stats.by_platform = by_platform.into_values().collect();
        Ok(stats)
    }

    #[tracing::instrument(name = "db.message.unread_count", skip_all, err)]
    async fn unread_count(&mut self, filter: ThreadFilter) -> Result<u64, RepositoryError> {
        let state = lock_state(&self.state)?;
        Ok(state
            .threads
            .values()
            .filter(|t| thread_matches(&filter, t))
            .map(|t| unread_of_thread(&state, t.id))
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tabfleet_data_model::{MessageDirection, MessageKind, SyncedMessage, SyncedThread};
    use tabfleet_storage::{
        MessageRepository, Pagination, RepositoryAccess, RepositoryFactory, SystemClock,
        ThreadFilter,
    };

    use crate::MemRepositoryFactory;

    fn thread_with(messages: Vec<SyncedMessage>) -> SyncedThread {
        SyncedThread {
            peer_id: "peer-1".to_owned(),
            peer_name: "Peer One".to_owned(),
            peer_avatar: None,
            messages,
        }
    }

    fn inbound(id: &str, content: &str) -> SyncedMessage {
        SyncedMessage {
            platform_message_id: id.to_owned(),
            direction: MessageDirection::Inbound,
            kind: MessageKind::Text,
            content: content.to_owned(),
            sent_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn store_sync_deduplicates_messages() {
        let factory = MemRepositoryFactory::new();
        let mut repo = factory.create().await.unwrap();
        let clock = SystemClock;
        let platform = "wechat".into();

        let first = repo
            .message()
            .store_sync(
                &clock,
                &platform,
                "alice",
                &[thread_with(vec![inbound("m1", "hi"), inbound("m2", "there")])],
            )
            .await
            .unwrap();
        assert_eq!(first.new_messages, 2);
        assert_eq!(first.updated_threads, 1);

        // Same payload again: nothing new, nothing updated.
        let second = repo
            .message()
            .store_sync(
                &clock,
                &platform,
                "alice",
                &[thread_with(vec![inbound("m1", "hi"), inbound("m2", "there")])],
            )
            .await
            .unwrap();
        assert_eq!(second.new_messages, 0);
        assert_eq!(second.updated_threads, 0);

        let threads = repo
            .message()
            .list_threads(ThreadFilter::new(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].unread_count, 2);
    }

    #[tokio::test]
    async fn mark_read_clears_unread_counters() {
        let factory = MemRepositoryFactory::new();
        let mut repo = factory.create().await.unwrap();
        let clock = SystemClock;
        let platform = "douyin".into();

        repo.message()
            .store_sync(
                &clock,
                &platform,
                "bob",
                &[thread_with(vec![inbound("m1", "ping"), inbound("m2", "pong")])],
            )
            .await
            .unwrap();

        let threads = repo
            .message()
            .list_threads(ThreadFilter::new(), Pagination::default())
            .await
            .unwrap();
        let thread_id = threads[0].id;

        let changed = repo.message().mark_read(thread_id, None).await.unwrap();
        assert_eq!(changed, 2);

        let unread = repo
            .message()
            .unread_count(ThreadFilter::new())
            .await
            .unwrap();
        assert_eq!(unread, 0);
    }

    #[tokio::test]
    async fn search_matches_content_case_insensitively() {
        let factory = MemRepositoryFactory::new();
        let mut repo = factory.create().await.unwrap();
        let clock = SystemClock;
        let platform = "wechat".into();

        repo.message()
            .store_sync(
                &clock,
                &platform,
                "alice",
                &[thread_with(vec![
                    inbound("m1", "Shipping Update"),
                    inbound("m2", "unrelated"),
                ])],
            )
            .await
            .unwrap();

        let hits = repo
            .message()
            .search(ThreadFilter::new(), "shipping", Pagination::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "Shipping Update");
    }

    #[tokio::test]
    async fn statistics_break_down_by_platform() {
        let factory = MemRepositoryFactory::new();
        let mut repo = factory.create().await.unwrap();
        let clock = SystemClock;

        repo.message()
            .store_sync(
                &clock,
                &"wechat".into(),
                "alice",
                &[thread_with(vec![inbound("m1", "a")])],
            )
            .await
            .unwrap();
        repo.message()
            .store_sync(
                &clock,
                &"douyin".into(),
                "bob",
                &[thread_with(vec![inbound("m2", "b"), inbound("m3", "c")])],
            )
            .await
            .unwrap();

        let stats = repo
            .message()
            .statistics(ThreadFilter::new())
            .await
            .unwrap();
        assert_eq!(stats.total_threads, 2);
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.unread_messages, 3);
        assert_eq!(stats.by_platform.len(), 2);
    }
}
