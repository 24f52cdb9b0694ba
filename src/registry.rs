//! Per-conversation bookkeeping of in-flight generations.
//!
//! Single-flight is enforced per conversation through the `DashMap` entry
//! lock for that key, so unrelated conversations never contend on one lock.
//! Retired streams linger for a short retention window so clients racing a
//! reconnect against completion can still learn the outcome.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Fragment, StreamStatus};

/// Returned by [`StreamRegistry::begin`]; the generation task owns it.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub stream_id: String,
    pub cancel: CancellationToken,
}

/// Catch-up view of an in-flight stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSnapshot {
    pub conversation_id: String,
    pub stream_id: String,
    pub status: StreamStatus,
    pub accumulated_text: String,
    /// Fragments `0..next_index` are folded into `accumulated_text`.
    pub next_index: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetiredOutcome {
    Completed { message_id: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetiredStream {
    pub stream_id: String,
    pub final_text: String,
    pub next_index: u32,
    pub outcome: RetiredOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Subscription {
    Active(StreamSnapshot),
    /// Finished within the retention window.
    Retired(RetiredStream),
    None,
}

#[derive(Debug)]
struct StreamEntry {
    stream_id: String,
    owner: String,
    status: StreamStatus,
    fragments: BTreeMap<u32, String>,
    accumulated: String,
    cancel: CancellationToken,
    outcome: Option<RetiredOutcome>,
    retired_at: Option<Instant>,
}

impl StreamEntry {
    fn next_index(&self) -> u32 {
        self.fragments.len() as u32
    }

    fn is_expired(&self, now: Instant, retention: Duration) -> bool {
        self.retired_at
            .is_some_and(|at| now.saturating_duration_since(at) >= retention)
    }

    fn retire(&mut self, outcome: RetiredOutcome) {
        self.status = StreamStatus::Done;
        self.outcome = Some(outcome);
        self.retired_at = Some(Instant::now());
    }
}

pub struct StreamRegistry {
    by_conversation: DashMap<String, StreamEntry>,
    conversation_of: DashMap<String, String>,
    retention: Duration,
}

impl StreamRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            by_conversation: DashMap::new(),
            conversation_of: DashMap::new(),
            retention,
        }
    }

    /// Opens a stream for `conversation_id`, or fails with `Conflict` if one is
    /// already in flight there.
    pub fn begin(&self, conversation_id: &str, owner: &str) -> Result<StreamHandle, AppError> {
        let stream_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let fresh = StreamEntry {
            stream_id: stream_id.clone(),
            owner: owner.to_string(),
            status: StreamStatus::Active,
            fragments: BTreeMap::new(),
            accumulated: String::new(),
            cancel: cancel.clone(),
            outcome: None,
            retired_at: None,
        };

        match self.by_conversation.entry(conversation_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.status.is_in_flight() {
                    return Err(AppError::Conflict {
                        conversation_id: conversation_id.to_string(),
                        stream_id: current.stream_id.clone(),
                    });
                }
                let replaced = std::mem::replace(occupied.get_mut(), fresh);
                self.conversation_of.remove(&replaced.stream_id);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }
        self.conversation_of
            .insert(stream_id.clone(), conversation_id.to_string());

        info!("Stream {stream_id} started for conversation {conversation_id}");
        Ok(StreamHandle { stream_id, cancel })
    }

    /// Appends the next piece of text, returning it as an indexed fragment.
    pub fn append(&self, stream_id: &str, text: &str) -> Result<Fragment, AppError> {
        self.with_live_entry(stream_id, |entry| {
            let index = entry.next_index();
            entry.fragments.insert(index, text.to_string());
            entry.accumulated.push_str(text);
            Fragment {
                stream_id: stream_id.to_string(),
                index,
                text: text.to_string(),
            }
        })
    }

    /// Retires the stream as completed and binds it to its persisted message.
    pub fn complete(
        &self,
        stream_id: &str,
        final_text: &str,
        message_id: &str,
    ) -> Result<(), AppError> {
        self.with_live_entry(stream_id, |entry| {
            entry.accumulated = final_text.to_string();
            entry.retire(RetiredOutcome::Completed { message_id: message_id.to_string() });
        })?;
        info!("Stream {stream_id} completed as message {message_id}");
        Ok(())
    }

    /// Retires the stream as failed. Accumulated text is kept.
    pub fn fail(&self, stream_id: &str, reason: &str) -> Result<(), AppError> {
        self.with_live_entry(stream_id, |entry| {
            entry.retire(RetiredOutcome::Failed { reason: reason.to_string() });
        })?;
        info!("Stream {stream_id} failed: {reason}");
        Ok(())
    }

    /// Forgets a stream that was never announced to any client.
    pub fn discard(&self, stream_id: &str) {
        let Some((_, conversation_id)) = self.conversation_of.remove(stream_id) else {
            return;
        };
        self.by_conversation
            .remove_if(&conversation_id, |_, entry| entry.stream_id == stream_id);
        debug!("Stream {stream_id} discarded");
    }

    /// Moves an active stream to `Stopping` and signals its generation.
    /// Stopping an already-stopping stream is a no-op.
    pub fn stop(&self, conversation_id: &str, stream_id: &str) -> Result<(), AppError> {
        let not_found = || AppError::StreamNotFound { stream_id: stream_id.to_string() };
        let mut entry = self.by_conversation.get_mut(conversation_id).ok_or_else(not_found)?;
        if entry.stream_id != stream_id || !entry.status.is_in_flight() {
            return Err(not_found());
        }
        if entry.status == StreamStatus::Active {
            entry.status = StreamStatus::Stopping;
            entry.cancel.cancel();
            info!("Stream {stream_id} stopping on request");
        }
        Ok(())
    }

    /// Idempotent, read-only view of the conversation's stream for a
    /// (re)attaching client.
    pub fn subscribe(&self, conversation_id: &str) -> Subscription {
        let now = Instant::now();
        let expired = {
            let Some(entry) = self.by_conversation.get(conversation_id) else {
                return Subscription::None;
            };
            if !entry.is_expired(now, self.retention) {
                return match &entry.outcome {
                    None => Subscription::Active(StreamSnapshot {
                        conversation_id: conversation_id.to_string(),
                        stream_id: entry.stream_id.clone(),
                        status: entry.status,
                        accumulated_text: entry.accumulated.clone(),
                        next_index: entry.next_index(),
                    }),
                    Some(outcome) => Subscription::Retired(RetiredStream {
                        stream_id: entry.stream_id.clone(),
                        final_text: entry.accumulated.clone(),
                        next_index: entry.next_index(),
                        outcome: outcome.clone(),
                    }),
                };
            }
            entry.stream_id.clone()
        };
        self.evict(conversation_id, &expired, now);
        Subscription::None
    }

    /// Current state of a stream by id, in flight or retained.
    pub fn snapshot(&self, stream_id: &str) -> Option<StreamSnapshot> {
        let conversation_id = self.conversation_of.get(stream_id)?.value().clone();
        let entry = self.by_conversation.get(&conversation_id)?;
        (entry.stream_id == stream_id).then(|| StreamSnapshot {
            conversation_id: conversation_id.clone(),
            stream_id: entry.stream_id.clone(),
            status: entry.status,
            accumulated_text: entry.accumulated.clone(),
            next_index: entry.next_index(),
        })
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.by_conversation
            .get(conversation_id)
            .is_some_and(|entry| entry.status.is_in_flight())
    }

    /// Conversations owned by `owner` that currently have a stream in flight.
    pub fn active_for_owner(&self, owner: &str) -> Vec<String> {
        self.by_conversation
            .iter()
            .filter(|entry| entry.owner == owner && entry.status.is_in_flight())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drops retired streams whose retention window has elapsed at `now`.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut purged = Vec::new();
        self.by_conversation.retain(|_, entry| {
            let expired = entry.is_expired(now, self.retention);
            if expired {
                purged.push(entry.stream_id.clone());
            }
            !expired
        });
        for stream_id in &purged {
            self.conversation_of.remove(stream_id);
        }
        if !purged.is_empty() {
            debug!("Purged {} retired stream(s)", purged.len());
        }
        purged.len()
    }

    /// Periodically purges expired streams until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.purge_expired(Instant::now());
            }
        })
    }

    fn evict(&self, conversation_id: &str, stream_id: &str, now: Instant) {
        let removed = self.by_conversation.remove_if(conversation_id, |_, entry| {
            entry.stream_id == stream_id && entry.is_expired(now, self.retention)
        });
        if removed.is_some() {
            self.conversation_of.remove(stream_id);
        }
    }

    fn with_live_entry<T>(
        &self,
        stream_id: &str,
        f: impl FnOnce(&mut StreamEntry) -> T,
    ) -> Result<T, AppError> {
        let not_found = || AppError::StreamNotFound { stream_id: stream_id.to_string() };
        let conversation_id = self
            .conversation_of
            .get(stream_id)
            .map(|c| c.value().clone())
            .ok_or_else(not_found)?;
        let mut entry = self.by_conversation.get_mut(&conversation_id).ok_or_else(not_found)?;
        if entry.stream_id != stream_id || !entry.status.is_in_flight() {
            return Err(not_found());
        }
        Ok(f(entry.value_mut()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StreamRegistry {
        StreamRegistry::new(Duration::from_secs(5))
    }

    #[test]
    fn begin_is_single_flight_per_conversation() {
        let registry = registry();
        let first = registry.begin("c1", "u1").unwrap();

        let err = registry.begin("c1", "u1").unwrap_err();
        assert!(matches!(err, AppError::Conflict { ref stream_id, .. } if *stream_id == first.stream_id));

        // Other conversations are unaffected.
        assert!(registry.begin("c2", "u1").is_ok());
    }

    #[test]
    fn conflicting_begin_leaves_original_stream_intact() {
        let registry = registry();
        let handle = registry.begin("c1", "u1").unwrap();
        registry.append(&handle.stream_id, "He").unwrap();
        let _ = registry.begin("c1", "u1");

        match registry.subscribe("c1") {
            Subscription::Active(snapshot) => {
                assert_eq!(snapshot.stream_id, handle.stream_id);
                assert_eq!(snapshot.accumulated_text, "He");
            }
            other => panic!("expected active stream, got {other:?}"),
        }
    }

    #[test]
    fn append_assigns_sequential_indices() {
        let registry = registry();
        let handle = registry.begin("c1", "u1").unwrap();
        let a = registry.append(&handle.stream_id, "He").unwrap();
        let b = registry.append(&handle.stream_id, "llo").unwrap();
        assert_eq!((a.index, b.index), (0, 1));

        let snapshot = registry.snapshot(&handle.stream_id).unwrap();
        assert_eq!(snapshot.accumulated_text, "Hello");
        assert_eq!(snapshot.next_index, 2);
    }

    #[test]
    fn subscribe_text_is_prefix_of_final_text() {
        let registry = registry();
        let handle = registry.begin("c1", "u1").unwrap();
        let mut seen = Vec::new();
        for piece in ["The ", "quick ", "fox"] {
            registry.append(&handle.stream_id, piece).unwrap();
            if let Subscription::Active(snapshot) = registry.subscribe("c1") {
                seen.push(snapshot.accumulated_text);
            }
        }
        registry.complete(&handle.stream_id, "The quick fox", "m1").unwrap();
        for text in seen {
            assert!("The quick fox".starts_with(&text));
        }
    }

    #[test]
    fn completed_stream_is_retired_then_replaceable() {
        let registry = registry();
        let handle = registry.begin("c1", "u1").unwrap();
        registry.append(&handle.stream_id, "Hi").unwrap();
        registry.complete(&handle.stream_id, "Hi", "42").unwrap();

        assert!(!registry.is_active("c1"));
        match registry.subscribe("c1") {
            Subscription::Retired(retired) => {
                assert_eq!(retired.final_text, "Hi");
                assert_eq!(
                    retired.outcome,
                    RetiredOutcome::Completed { message_id: "42".into() }
                );
            }
            other => panic!("expected retired stream, got {other:?}"),
        }

        // A retired stream no longer accepts fragments.
        assert!(registry.append(&handle.stream_id, "late").is_err());
        assert!(registry.begin("c1", "u1").is_ok());
        assert!(registry.snapshot(&handle.stream_id).is_none());
    }

    #[test]
    fn stop_marks_stopping_and_cancels() {
        let registry = registry();
        let handle = registry.begin("c1", "u1").unwrap();
        registry.stop("c1", &handle.stream_id).unwrap();
        assert!(handle.cancel.is_cancelled());
        assert!(registry.is_active("c1"));
        assert_eq!(
            registry.snapshot(&handle.stream_id).unwrap().status,
            StreamStatus::Stopping
        );

        // Idempotent while stopping; still single-flight.
        registry.stop("c1", &handle.stream_id).unwrap();
        assert!(registry.begin("c1", "u1").is_err());
    }

    #[test]
    fn stop_rejects_mismatched_or_finished_streams() {
        let registry = registry();
        let handle = registry.begin("c1", "u1").unwrap();
        assert!(registry.stop("c2", &handle.stream_id).is_err());
        assert!(registry.stop("c1", "other").is_err());

        registry.fail(&handle.stream_id, "boom").unwrap();
        assert!(registry.stop("c1", &handle.stream_id).unwrap_err().is_not_found());
    }

    #[test]
    fn discarded_stream_frees_the_conversation() {
        let registry = registry();
        let handle = registry.begin("c1", "u1").unwrap();
        registry.discard(&handle.stream_id);
        assert_eq!(registry.subscribe("c1"), Subscription::None);
        assert!(registry.begin("c1", "u1").is_ok());
    }

    #[test]
    fn expired_streams_are_purged() {
        let registry = StreamRegistry::new(Duration::from_millis(10));
        let handle = registry.begin("c1", "u1").unwrap();
        registry.complete(&handle.stream_id, "", "1").unwrap();
        let active = registry.begin("c2", "u1").unwrap();

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(registry.purge_expired(later), 1);
        assert_eq!(registry.subscribe("c1"), Subscription::None);
        assert!(registry.snapshot(&active.stream_id).is_some());
    }

    #[test]
    fn active_for_owner_filters_by_user_and_status() {
        let registry = registry();
        registry.begin("c1", "alice").unwrap();
        registry.begin("c2", "bob").unwrap();
        let done = registry.begin("c3", "alice").unwrap();
        registry.fail(&done.stream_id, "boom").unwrap();

        assert_eq!(registry.active_for_owner("alice"), vec!["c1".to_string()]);
    }
}
