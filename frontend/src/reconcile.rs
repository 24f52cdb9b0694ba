//! Client-side reconciliation of live stream events with local display state.
//!
//! `ClientEngine` is pure: it takes server events and user intents and hands
//! back the commands to send plus anything worth surfacing. Socket handling
//! and rendering live elsewhere, which keeps every transition testable here.
//!
//! Per conversation the engine moves through idle, awaiting-start and
//! streaming. Submissions queue a placeholder in FIFO order; the next `start`
//! (or `subscription_confirmed`) for that conversation binds the head of the
//! queue. A stream joined without a queued placeholder gets an ephemeral
//! entry instead. Fragments are kept sparse by index and only the gap-free
//! prefix is ever displayed.

use std::collections::btree_map::Entry as Slot;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::errors::ClientError;
use crate::merge::{self, Entry, EntryKey, EntryStatus, Priority, Role};
use crate::models::{ClientCommand, CommandKind, Message, RejectCode, ServerEvent};

/// Cap on fragments held for streams that have not been bound yet.
const MAX_ORPHAN_FRAGMENTS: usize = 256;
/// Cap on terminal stream ids remembered for dropping late replays.
const MAX_RESOLVED_STREAMS: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingStart,
    Streaming,
}

/// Where an event for a given conversation should land.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    View,
    Background,
}

pub fn route(conversation_id: &str, viewed: Option<&str>) -> Route {
    if viewed == Some(conversation_id) {
        Route::View
    } else {
        Route::Background
    }
}

/// Follow-up work for the caller after an event has been applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Applied {
    pub notice: Option<ClientError>,
    /// The viewed conversation should be backfilled from the store.
    pub refresh: bool,
}

#[derive(Clone, Debug)]
struct StreamAssembly {
    entry: EntryKey,
    /// Text covering every index below `next_index`.
    base: String,
    next_index: u32,
    fragments: BTreeMap<u32, String>,
}

impl StreamAssembly {
    fn new(entry: EntryKey) -> Self {
        Self { entry, base: String::new(), next_index: 0, fragments: BTreeMap::new() }
    }

    fn insert(&mut self, index: u32, text: String) {
        if index >= self.next_index {
            self.fragments.entry(index).or_insert(text);
        }
    }

    fn text(&self) -> String {
        let mut out = self.base.clone();
        let mut index = self.next_index;
        while let Some(text) = self.fragments.get(&index) {
            out.push_str(text);
            index += 1;
        }
        out
    }

    /// Takes the server's accumulated text unless what is shown is longer.
    fn adopt(&mut self, accumulated: String, next_index: u32) {
        if accumulated.len() < self.text().len() {
            return;
        }
        self.base = accumulated;
        self.next_index = next_index;
        self.fragments = self.fragments.split_off(&next_index);
    }
}

/// What was unresolved when a `subscribe` went out. The `no_active_stream`
/// answering it may only clear these.
#[derive(Clone, Debug, Default)]
struct SubscribeMark {
    placeholders: Vec<u64>,
    streams: Vec<String>,
}

/// Display state of one open conversation.
#[derive(Clone, Debug, Default)]
pub struct ConversationView {
    entries: Vec<Entry>,
    awaiting_bind: VecDeque<u64>,
    streams: HashMap<String, StreamAssembly>,
    /// One mark per `subscribe` still waiting on its answer, oldest first.
    subscribe_marks: VecDeque<SubscribeMark>,
}

impl ConversationView {
    fn from_persisted(messages: &[Message]) -> Self {
        Self { entries: messages.iter().map(Entry::persisted).collect(), ..Self::default() }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    fn is_unresolved(&self) -> bool {
        !self.awaiting_bind.is_empty() || !self.streams.is_empty()
    }

    fn entry_mut(&mut self, key: &EntryKey) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| &e.key == key)
    }

    fn remove_entry(&mut self, key: &EntryKey) {
        self.entries.retain(|e| &e.key != key);
    }

    fn refresh_text(&mut self, stream_id: &str) {
        let Some(assembly) = self.streams.get(stream_id) else {
            return;
        };
        let text = assembly.text();
        let key = assembly.entry.clone();
        if let Some(entry) = self.entry_mut(&key) {
            entry.text = text;
        }
    }

    fn bind(&mut self, stream_id: &str) {
        if self.streams.contains_key(stream_id) {
            return;
        }
        let key = match self.awaiting_bind.pop_front() {
            Some(id) => EntryKey::Placeholder(id),
            None => {
                let key = EntryKey::Ephemeral(stream_id.to_string());
                self.entries.push(Entry {
                    key: key.clone(),
                    role: Role::Assistant,
                    text: String::new(),
                    status: EntryStatus::Streaming,
                    provisional: false,
                });
                key
            }
        };
        if let Some(entry) = self.entry_mut(&key) {
            entry.status = EntryStatus::Streaming;
        }
        self.streams.insert(stream_id.to_string(), StreamAssembly::new(key));
    }

    fn push_fragment(&mut self, stream_id: &str, index: u32, text: String) {
        if let Some(assembly) = self.streams.get_mut(stream_id) {
            assembly.insert(index, text);
        }
        self.refresh_text(stream_id);
    }

    fn adopt(&mut self, stream_id: &str, accumulated: String, next_index: u32) {
        if let Some(assembly) = self.streams.get_mut(stream_id) {
            assembly.adopt(accumulated, next_index);
        }
        self.refresh_text(stream_id);
    }

    /// Turns the stream's entry into the persisted reply.
    fn resolve(&mut self, stream_id: &str, message_id: String, final_text: String) {
        let persisted = EntryKey::Persisted(message_id);
        let bound = self.streams.remove(stream_id).map(|a| a.entry);
        if self.entries.iter().any(|e| e.key == persisted) {
            // A backfill got there first.
            if let Some(key) = bound {
                self.remove_entry(&key);
            }
            return;
        }
        let resolved = Entry {
            key: persisted,
            role: Role::Assistant,
            text: final_text,
            status: EntryStatus::Settled,
            provisional: true,
        };
        match bound.and_then(|key| self.entries.iter().position(|e| e.key == key)) {
            Some(pos) => self.entries[pos] = resolved,
            None => self.entries.push(resolved),
        }
    }

    fn interrupt(&mut self, stream_id: &str) {
        if let Some(assembly) = self.streams.remove(stream_id) {
            if let Some(entry) = self.entry_mut(&assembly.entry) {
                entry.status = EntryStatus::Interrupted;
            }
        }
    }

    fn mark_subscribe(&mut self) {
        self.subscribe_marks.push_back(SubscribeMark {
            placeholders: self.awaiting_bind.iter().copied().collect(),
            streams: self.streams.keys().cloned().collect(),
        });
    }

    /// Retires the oldest outstanding subscribe. Without one, everything
    /// currently unresolved counts as covered.
    fn take_subscribe_mark(&mut self) -> SubscribeMark {
        self.subscribe_marks.pop_front().unwrap_or_else(|| SubscribeMark {
            placeholders: self.awaiting_bind.iter().copied().collect(),
            streams: self.streams.keys().cloned().collect(),
        })
    }

    /// Drops the placeholders the answered subscribe covered. Entries that
    /// already show text are kept as interrupted; anything queued after the
    /// subscribe went out is left alone. Returns the stream ids unbound.
    fn clear_unresolved(&mut self) -> Vec<String> {
        let mark = self.take_subscribe_mark();
        let mut unbound = Vec::with_capacity(mark.streams.len());
        for stream_id in mark.streams {
            let Some(assembly) = self.streams.remove(&stream_id) else {
                continue;
            };
            if let Some(entry) = self.entry_mut(&assembly.entry) {
                entry.status = EntryStatus::Interrupted;
            }
            unbound.push(stream_id);
        }
        for id in mark.placeholders {
            if let Some(pos) = self.awaiting_bind.iter().position(|queued| *queued == id) {
                self.awaiting_bind.remove(pos);
                self.remove_entry(&EntryKey::Placeholder(id));
            }
        }
        self.entries
            .retain(|e| !(e.status == EntryStatus::Interrupted && e.text.is_empty()));
        unbound
    }

    /// Undoes the oldest queued submission after the server refused it.
    fn unsend_head(&mut self) {
        let Some(id) = self.awaiting_bind.pop_front() else {
            return;
        };
        self.remove_entry(&EntryKey::Placeholder(id));
        if let Some(entry) = self.entry_mut(&EntryKey::LocalUser(id)) {
            entry.status = EntryStatus::Unsent;
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClientEngine {
    views: HashMap<String, ConversationView>,
    pending: HashMap<String, bool>,
    /// Unresolved streams this client knows about, by conversation.
    stream_conversation: HashMap<String, String>,
    resolved: HashSet<String>,
    resolved_order: VecDeque<String>,
    orphans: HashMap<String, BTreeMap<u32, String>>,
    orphan_order: VecDeque<String>,
    orphan_count: usize,
    next_local_id: u64,
}

impl ClientEngine {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn entries(&self, conversation_id: &str) -> &[Entry] {
        self.views.get(conversation_id).map(ConversationView::entries).unwrap_or(&[])
    }

    pub fn phase(&self, conversation_id: &str) -> Phase {
        match self.views.get(conversation_id) {
            Some(view) if !view.streams.is_empty() => Phase::Streaming,
            Some(view) if !view.awaiting_bind.is_empty() => Phase::AwaitingStart,
            _ => Phase::Idle,
        }
    }

    pub fn is_pending(&self, conversation_id: &str) -> bool {
        self.pending.get(conversation_id).copied().unwrap_or(false)
            || self.phase(conversation_id) != Phase::Idle
    }

    pub fn active_stream(&self, conversation_id: &str) -> Option<&str> {
        self.stream_conversation
            .iter()
            .find(|(_, conv)| conv.as_str() == conversation_id)
            .map(|(stream_id, _)| stream_id.as_str())
    }

    // ── User intents ─────────────────────────────────────────────────────────

    /// Shows the persisted history and asks the server for any live stream.
    pub fn open_conversation(&mut self, conversation_id: &str, persisted: &[Message]) -> ClientCommand {
        if self.views.contains_key(conversation_id) {
            self.backfill(conversation_id, persisted);
        } else {
            self.views
                .insert(conversation_id.to_string(), ConversationView::from_persisted(persisted));
        }
        if let Some(view) = self.views.get_mut(conversation_id) {
            view.mark_subscribe();
        }
        ClientCommand::Subscribe { conversation_id: conversation_id.to_string() }
    }

    pub fn leave_conversation(&mut self, conversation_id: &str) {
        self.views.remove(conversation_id);
    }

    /// Adds the optimistic user message and its reply placeholder.
    pub fn submit(&mut self, conversation_id: &str, content: &str) -> Result<ClientCommand, ClientError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::EmptyMessage);
        }

        self.next_local_id += 1;
        let id = self.next_local_id;
        let view = self.views.entry(conversation_id.to_string()).or_default();
        view.entries.push(Entry {
            key: EntryKey::LocalUser(id),
            role: Role::User,
            text: content.to_string(),
            status: EntryStatus::Sending,
            provisional: false,
        });
        view.entries.push(Entry {
            key: EntryKey::Placeholder(id),
            role: Role::Assistant,
            text: String::new(),
            status: EntryStatus::Loading,
            provisional: false,
        });
        view.awaiting_bind.push_back(id);

        Ok(ClientCommand::Submit {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
        })
    }

    pub fn stop_command(&self, conversation_id: &str) -> Option<ClientCommand> {
        let stream_id = self.active_stream(conversation_id)?;
        Some(ClientCommand::Stop {
            conversation_id: conversation_id.to_string(),
            stream_id: stream_id.to_string(),
        })
    }

    /// Called once a replacement socket is open. The server replays pending
    /// flags on connect, so the local ones are dropped first.
    pub fn reconnect_commands(&mut self, viewed: Option<&str>) -> Vec<ClientCommand> {
        self.pending.clear();
        let Some(conversation_id) = viewed else {
            return Vec::new();
        };
        if let Some(view) = self.views.get_mut(conversation_id) {
            // Answers to subscribes sent on the old socket will never arrive.
            view.subscribe_marks.clear();
            view.mark_subscribe();
        }
        vec![ClientCommand::Subscribe { conversation_id: conversation_id.to_string() }]
    }

    /// Merges a fresh message list into an open conversation.
    pub fn backfill(&mut self, conversation_id: &str, persisted: &[Message]) -> Option<ClientError> {
        let view = self.views.get_mut(conversation_id)?;
        let priority = if view.is_unresolved() {
            Priority::PreferLocal
        } else {
            Priority::PreferPersisted
        };
        view.entries = merge::merge(&view.entries, persisted, priority);

        let missing = view
            .entries
            .iter()
            .filter(|e| e.provisional && e.persisted_id().is_some())
            .count();
        (missing > 0).then(|| ClientError::PersistenceLag {
            conversation_id: conversation_id.to_string(),
            missing,
        })
    }

    // ── Server events ────────────────────────────────────────────────────────

    pub fn apply(&mut self, event: ServerEvent, viewed: Option<&str>) -> Applied {
        match event {
            ServerEvent::Connected => Applied::default(),
            ServerEvent::Start { conversation_id, stream_id } => {
                if !self.resolved.contains(&stream_id) {
                    self.track(&conversation_id, &stream_id);
                    self.attach(&conversation_id, &stream_id, viewed);
                }
                Applied::default()
            }
            ServerEvent::Fragment { stream_id, index, text } => {
                self.on_fragment(stream_id, index, text, viewed);
                Applied::default()
            }
            ServerEvent::Complete { stream_id, message_id, final_text } => {
                self.on_complete(stream_id, message_id, final_text, viewed)
            }
            ServerEvent::Error { stream_id, message } => self.on_error(stream_id, message, viewed),
            ServerEvent::SubscriptionConfirmed {
                conversation_id,
                stream_id,
                accumulated_text,
                next_index,
            } => {
                if route(&conversation_id, viewed) == Route::View {
                    if let Some(view) = self.views.get_mut(&conversation_id) {
                        view.subscribe_marks.pop_front();
                    }
                }
                if !self.resolved.contains(&stream_id) {
                    self.track(&conversation_id, &stream_id);
                    if self.attach(&conversation_id, &stream_id, viewed) {
                        if let Some(view) = self.views.get_mut(&conversation_id) {
                            view.adopt(&stream_id, accumulated_text, next_index);
                        }
                    }
                }
                Applied::default()
            }
            ServerEvent::NoActiveStream { conversation_id } => {
                self.pending.insert(conversation_id.clone(), false);
                if route(&conversation_id, viewed) == Route::Background {
                    return Applied::default();
                }
                if let Some(view) = self.views.get_mut(&conversation_id) {
                    for stream_id in view.clear_unresolved() {
                        self.stream_conversation.remove(&stream_id);
                    }
                }
                // A reply may have completed while nobody was listening.
                Applied { refresh: true, ..Applied::default() }
            }
            ServerEvent::Pending { conversation_id, pending } => {
                self.pending.insert(conversation_id, pending);
                Applied::default()
            }
            ServerEvent::Rejected { conversation_id, command, code, message } => {
                if command == CommandKind::Submit {
                    if let Some(view) =
                        conversation_id.as_deref().and_then(|id| self.views.get_mut(id))
                    {
                        view.unsend_head();
                    }
                }
                let notice = match (code, conversation_id) {
                    (RejectCode::Conflict, Some(conversation_id)) => {
                        ClientError::Conflict { conversation_id }
                    }
                    _ => ClientError::Rejected { message },
                };
                Applied { notice: Some(notice), refresh: false }
            }
        }
    }

    fn track(&mut self, conversation_id: &str, stream_id: &str) {
        self.pending.insert(conversation_id.to_string(), true);
        self.stream_conversation
            .insert(stream_id.to_string(), conversation_id.to_string());
    }

    /// Binds the stream to the viewed conversation and replays fragments
    /// that arrived before it. Returns false for background conversations.
    fn attach(&mut self, conversation_id: &str, stream_id: &str, viewed: Option<&str>) -> bool {
        let early = self.take_orphans(stream_id);
        if route(conversation_id, viewed) == Route::Background {
            return false;
        }
        let view = self.views.entry(conversation_id.to_string()).or_default();
        view.bind(stream_id);
        for (index, text) in early {
            view.push_fragment(stream_id, index, text);
        }
        view.refresh_text(stream_id);
        true
    }

    fn on_fragment(&mut self, stream_id: String, index: u32, text: String, viewed: Option<&str>) {
        if self.resolved.contains(&stream_id) {
            return;
        }
        let Some(conversation_id) = self.stream_conversation.get(&stream_id).cloned() else {
            self.buffer_orphan(stream_id, index, text);
            return;
        };
        if route(&conversation_id, viewed) == Route::Background {
            return;
        }
        let bound = self
            .views
            .get(&conversation_id)
            .is_some_and(|view| view.streams.contains_key(&stream_id));
        if bound {
            if let Some(view) = self.views.get_mut(&conversation_id) {
                view.push_fragment(&stream_id, index, text);
            }
        } else {
            // Viewed, but waiting on `subscription_confirmed` to bind.
            self.buffer_orphan(stream_id, index, text);
        }
    }

    fn on_complete(
        &mut self,
        stream_id: String,
        message_id: String,
        final_text: String,
        viewed: Option<&str>,
    ) -> Applied {
        if !self.mark_resolved(&stream_id) {
            return Applied::default();
        }
        self.take_orphans(&stream_id);
        let Some(conversation_id) = self.stream_conversation.remove(&stream_id) else {
            // Never saw it start; the store already has the reply.
            return Applied { refresh: viewed.is_some(), ..Applied::default() };
        };
        self.pending.insert(conversation_id.clone(), false);
        if route(&conversation_id, viewed) == Route::View {
            self.views
                .entry(conversation_id)
                .or_default()
                .resolve(&stream_id, message_id, final_text);
        }
        Applied::default()
    }

    fn on_error(&mut self, stream_id: String, message: String, viewed: Option<&str>) -> Applied {
        if !self.mark_resolved(&stream_id) {
            return Applied::default();
        }
        self.take_orphans(&stream_id);
        let notice = Some(ClientError::Generation { message });
        let Some(conversation_id) = self.stream_conversation.remove(&stream_id) else {
            return Applied { notice, refresh: false };
        };
        self.pending.insert(conversation_id.clone(), false);
        if route(&conversation_id, viewed) == Route::Background {
            return Applied::default();
        }
        if let Some(view) = self.views.get_mut(&conversation_id) {
            view.interrupt(&stream_id);
        }
        Applied { notice, refresh: false }
    }

    /// Remembers a terminal stream; false if it already was.
    fn mark_resolved(&mut self, stream_id: &str) -> bool {
        if !self.resolved.insert(stream_id.to_string()) {
            return false;
        }
        self.resolved_order.push_back(stream_id.to_string());
        while self.resolved_order.len() > MAX_RESOLVED_STREAMS {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
        true
    }

    fn buffer_orphan(&mut self, stream_id: String, index: u32, text: String) {
        if !self.orphans.contains_key(&stream_id) {
            self.orphan_order.push_back(stream_id.clone());
        }
        if let Slot::Vacant(slot) = self.orphans.entry(stream_id).or_default().entry(index) {
            slot.insert(text);
            self.orphan_count += 1;
        }
        while self.orphan_count > MAX_ORPHAN_FRAGMENTS {
            let Some(oldest) = self.orphan_order.pop_front() else {
                break;
            };
            if let Some(dropped) = self.orphans.remove(&oldest) {
                log::warn!("Dropped {} early fragments of stream {oldest}", dropped.len());
                self.orphan_count -= dropped.len();
            }
        }
    }

    fn take_orphans(&mut self, stream_id: &str) -> BTreeMap<u32, String> {
        let Some(taken) = self.orphans.remove(stream_id) else {
            return BTreeMap::new();
        };
        self.orphan_order.retain(|id| id != stream_id);
        self.orphan_count -= taken.len();
        taken
    }
}
