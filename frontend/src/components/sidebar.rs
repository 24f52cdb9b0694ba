use leptos::prelude::*;

use crate::state::AppState;

/// Sidebar showing conversation list, pending indicators and "New Chat" button.
#[component]
pub fn Sidebar() -> impl IntoView {
    let state = expect_context::<AppState>();

    let on_new = move |_| state.new_conversation();

    view! {
        <aside class="sidebar">
            <div class="sidebar-header">
                <h2>"Chat Stream"</h2>
                <button class="new-chat-btn" on:click=on_new>
                    "+ New Chat"
                </button>
            </div>
            <div class="conversation-list">
                {move || {
                    if state.conversations.with(|c| c.is_empty()) {
                        view! {
                            <div style="padding:1rem;color:var(--text-secondary);font-size:0.85rem">
                                "No conversations yet"
                            </div>
                        }.into_any()
                    } else {
                        view! {
                            <For
                                each=move || state.conversations.get()
                                key=|c| c.id.clone()
                                let:conv
                            >
                                {
                                    let id_click = conv.id.clone();
                                    let id_active = conv.id.clone();
                                    let id_pending = conv.id.clone();
                                    view! {
                                        <div
                                            class="conversation-item"
                                            class:active=move || {
                                                state.active_conversation.get().as_deref() == Some(id_active.as_str())
                                            }
                                            on:click=move |_| {
                                                state.select_conversation(id_click.clone());
                                            }
                                        >
                                            <span class="conversation-title">{conv.title.clone()}</span>
                                            <Show when=move || state.engine.with(|e| e.is_pending(&id_pending))>
                                                <span class="pending-dot" title="Generating…"></span>
                                            </Show>
                                        </div>
                                    }
                                }
                            </For>
                        }.into_any()
                    }
                }}
            </div>
        </aside>
    }
}
