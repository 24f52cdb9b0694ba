//! Reconciles a backfill from the message store with local display state.
//!
//! While a conversation still has an unresolved stream, local state wins:
//! known entries pick up their persisted versions but nothing new is spliced
//! in. Once resolved, the store is authoritative, except for locally resolved
//! replies the store has not caught up with yet, which stay as provisional,
//! and interrupted partial replies, which stay until a stored reply covers them.

use std::collections::HashSet;

use crate::models::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// A stream is unresolved; local entries are kept as they are.
    PreferLocal,
    /// Everything is resolved; the persisted list replaces local state.
    PreferPersisted,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Persisted(String),
    /// Optimistic copy of a submitted user message.
    LocalUser(u64),
    /// Stand-in for the reply to the `LocalUser` with the same id.
    Placeholder(u64),
    /// Reply to a stream this client did not submit (joined mid-stream).
    Ephemeral(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn from_wire(role: &str) -> Self {
        match role.to_ascii_uppercase().as_str() {
            "USER" => Role::User,
            "SYSTEM" => Role::System,
            _ => Role::Assistant,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    Settled,
    /// Optimistic user message not yet confirmed.
    Sending,
    /// Placeholder waiting for its stream to start.
    Loading,
    Streaming,
    /// Stream ended without completing; text received so far is kept.
    Interrupted,
    /// Submission was rejected by the server.
    Unsent,
}

impl EntryStatus {
    pub fn is_loading(&self) -> bool {
        matches!(self, EntryStatus::Loading | EntryStatus::Streaming)
    }
}

/// One displayed message.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub key: EntryKey,
    pub role: Role,
    pub text: String,
    pub status: EntryStatus,
    /// Resolved locally but not yet seen in a backfill.
    pub provisional: bool,
}

impl Entry {
    pub fn persisted(message: &Message) -> Self {
        Self {
            key: EntryKey::Persisted(message.id.clone()),
            role: Role::from_wire(&message.role),
            text: message.content.clone(),
            status: EntryStatus::Settled,
            provisional: false,
        }
    }

    pub fn persisted_id(&self) -> Option<&str> {
        match &self.key {
            EntryKey::Persisted(id) => Some(id),
            _ => None,
        }
    }
}

/// Merges local entries with a persisted message list under `priority`.
pub fn merge(local: &[Entry], persisted: &[Message], priority: Priority) -> Vec<Entry> {
    let known: HashSet<&str> = local.iter().filter_map(Entry::persisted_id).collect();
    // Persisted user messages no local entry accounts for yet; optimistic
    // copies are matched against these by text, oldest first.
    let mut unclaimed: Vec<&Message> = persisted
        .iter()
        .filter(|m| Role::from_wire(&m.role) == Role::User && !known.contains(m.id.as_str()))
        .collect();
    let mut claim = |text: &str| {
        unclaimed
            .iter()
            .position(|m| m.content == text)
            .map(|pos| unclaimed.remove(pos))
    };

    // Assistant replies no local entry accounts for; an interrupted partial
    // whose text one of these extends has been superseded by it.
    let unseen_replies: Vec<&str> = persisted
        .iter()
        .filter(|m| Role::from_wire(&m.role) == Role::Assistant && !known.contains(m.id.as_str()))
        .map(|m| m.content.as_str())
        .collect();

    match priority {
        Priority::PreferLocal => local
            .iter()
            .map(|entry| match &entry.key {
                EntryKey::Persisted(id) => persisted
                    .iter()
                    .find(|m| &m.id == id)
                    .map(Entry::persisted)
                    .unwrap_or_else(|| entry.clone()),
                EntryKey::LocalUser(_) if entry.status == EntryStatus::Sending => claim(&entry.text)
                    .map(Entry::persisted)
                    .unwrap_or_else(|| entry.clone()),
                _ => entry.clone(),
            })
            .collect(),
        Priority::PreferPersisted => {
            let stored: HashSet<&str> = persisted.iter().map(|m| m.id.as_str()).collect();
            let mut merged: Vec<Entry> = persisted.iter().map(Entry::persisted).collect();
            for entry in local {
                match &entry.key {
                    EntryKey::Persisted(id) if !stored.contains(id.as_str()) => {
                        merged.push(Entry { provisional: true, ..entry.clone() });
                    }
                    EntryKey::LocalUser(_) => {
                        let confirmed =
                            entry.status == EntryStatus::Sending && claim(&entry.text).is_some();
                        if !confirmed {
                            merged.push(entry.clone());
                        }
                    }
                    EntryKey::Placeholder(_) | EntryKey::Ephemeral(_)
                        if entry.status == EntryStatus::Interrupted && !entry.text.is_empty() =>
                    {
                        let superseded =
                            unseen_replies.iter().any(|reply| reply.starts_with(&entry.text));
                        if !superseded {
                            merged.push(entry.clone());
                        }
                    }
                    _ => {}
                }
            }
            merged
        }
    }
}
