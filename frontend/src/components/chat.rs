use leptos::ev;
use leptos::prelude::*;

use crate::merge::{Entry, EntryKey, EntryStatus};
use crate::reconcile::Phase;
use crate::state::AppState;

/// Main chat area with message history, live replies, and input.
#[component]
pub fn ChatArea() -> impl IntoView {
    let state = expect_context::<AppState>();

    let entries = move || match state.active_conversation.get() {
        Some(id) => state.engine.with(|e| e.entries(&id).to_vec()),
        None => Vec::new(),
    };

    view! {
        <main class="chat-area">
            // Error banner
            {move || {
                state.error.get().map(|err| {
                    view! {
                        <div class="error-banner">
                            {err}
                            <Show when=move || state.connection_lost.get()>
                                <button class="retry-btn" on:click=move |_| state.retry_connection()>
                                    "Reconnect"
                                </button>
                            </Show>
                        </div>
                    }
                })
            }}

            // Chat header
            <div class="chat-header">
                {move || {
                    let active = state.active_conversation.get();
                    state.conversations.with(|list| {
                        active
                            .and_then(|id| list.iter().find(|c| c.id == id).map(|c| c.title.clone()))
                            .unwrap_or_else(|| "Select or start a conversation".to_string())
                    })
                }}
            </div>

            // Messages
            <div class="messages-container">
                {move || {
                    if entries().is_empty() {
                        view! {
                            <div class="empty-state">
                                "Send a message to start chatting"
                            </div>
                        }.into_any()
                    } else {
                        view! {
                            <For
                                each=entries
                                key=|entry| (entry_key(&entry.key), entry.text.clone(), entry.status)
                                let:entry
                            >
                                <MessageBubble entry=entry />
                            </For>
                        }.into_any()
                    }
                }}
            </div>

            // Input area
            <ChatInput />
        </main>
    }
}

fn entry_key(key: &EntryKey) -> String {
    match key {
        EntryKey::Persisted(id) => format!("m-{id}"),
        EntryKey::LocalUser(id) => format!("u-{id}"),
        EntryKey::Placeholder(id) => format!("p-{id}"),
        EntryKey::Ephemeral(stream_id) => format!("s-{stream_id}"),
    }
}

/// A single chat message bubble.
#[component]
fn MessageBubble(entry: Entry) -> impl IntoView {
    let css_class = format!("message {}", entry.role.label());
    let body_class = if entry.status.is_loading() { "streaming-cursor" } else { "" };
    let note = match entry.status {
        EntryStatus::Interrupted => Some("(interrupted)"),
        EntryStatus::Unsent => Some("(not sent)"),
        _ if entry.provisional => Some("(saving…)"),
        _ => None,
    };

    view! {
        <div class=css_class>
            <div class="role-label">{entry.role.label()}</div>
            <div class=body_class>{entry.text}</div>
            {note.map(|n| view! { <div class="message-note">{n}</div> })}
        </div>
    }
}

/// Chat input form with textarea, send and stop buttons.
#[component]
fn ChatInput() -> impl IntoView {
    let state = expect_context::<AppState>();
    let (input, set_input) = signal(String::new());

    let phase = move || match state.active_conversation.get() {
        Some(id) => state.engine.with(|e| e.phase(&id)),
        None => Phase::Idle,
    };
    let busy = move || match state.active_conversation.get() {
        Some(id) => state.engine.with(|e| e.is_pending(&id)),
        None => true,
    };

    let send = move || {
        let text = input.get_untracked().trim().to_string();
        if text.is_empty() || busy() {
            return;
        }
        set_input.set(String::new());
        state.send_message(text);
    };

    let on_keydown = move |ev: ev::KeyboardEvent| {
        if ev.key() == "Enter" && !ev.shift_key() {
            ev.prevent_default();
            send();
        }
    };

    view! {
        <div class="input-area">
            <div class="input-row">
                <textarea
                    rows="1"
                    placeholder="Type a message… (Enter to send, Shift+Enter for newline)"
                    prop:value=input
                    on:input=move |ev| {
                        set_input.set(event_target_value(&ev));
                    }
                    on:keydown=on_keydown
                    disabled=busy
                />
                <Show
                    when=move || phase() == Phase::Streaming
                    fallback=move || view! {
                        <button
                            class="send-btn"
                            on:click=move |_| send()
                            disabled=move || busy() || input.get().trim().is_empty()
                        >
                            {move || if busy() { "Waiting…" } else { "Send" }}
                        </button>
                    }
                >
                    <button class="stop-btn" on:click=move |_| state.stop_generation()>
                        "Stop"
                    </button>
                </Show>
            </div>
        </div>
    }
}
