use std::rc::Rc;

use gloo_timers::callback::Interval;
use leptos::prelude::*;
use leptos::task::spawn_local;

use crate::api;
use crate::errors::ClientError;
use crate::models::{ClientCommand, Conversation, ServerEvent};
use crate::reconcile::{Applied, ClientEngine};
use crate::ws;

/// How often the viewed conversation is re-read from the message store.
const BACKFILL_INTERVAL_MS: u32 = 15_000;

/// Shared application state, provided via Leptos context.
#[derive(Clone, Copy)]
pub struct AppState {
    // --- Read signals (for components to subscribe to) ---
    pub conversations: ReadSignal<Vec<Conversation>>,
    pub active_conversation: ReadSignal<Option<String>>,
    pub engine: ReadSignal<ClientEngine>,
    pub error: ReadSignal<Option<String>>,
    pub connection_lost: ReadSignal<bool>,

    // --- Write signals (for mutating state) ---
    pub set_conversations: WriteSignal<Vec<Conversation>>,
    pub set_active_conversation: WriteSignal<Option<String>>,
    pub set_engine: WriteSignal<ClientEngine>,
    pub set_error: WriteSignal<Option<String>>,
    pub set_connection_lost: WriteSignal<bool>,
}

impl AppState {
    /// Create a new `AppState` and provide it in the current Leptos context.
    pub fn provide() -> Self {
        let (conversations, set_conversations) = signal(Vec::<Conversation>::new());
        let (active_conversation, set_active_conversation) = signal(None::<String>);
        let (engine, set_engine) = signal(ClientEngine::new());
        let (error, set_error) = signal(None::<String>);
        let (connection_lost, set_connection_lost) = signal(false);

        let state = Self {
            conversations,
            active_conversation,
            engine,
            error,
            connection_lost,
            set_conversations,
            set_active_conversation,
            set_engine,
            set_error,
            set_connection_lost,
        };

        provide_context(state);
        state
    }

    fn viewed(&self) -> Option<String> {
        self.active_conversation.get_untracked()
    }

    fn report(&self, error: ClientError) {
        if error.is_user_visible() {
            log::error!("{error}");
            self.set_error.set(Some(error.to_string()));
        } else {
            log::debug!("{error}");
        }
    }

    fn send(&self, command: &ClientCommand) {
        if let Err(e) = ws::send(command) {
            self.report(e);
        }
    }

    /// Opens the gateway socket and wires its events into the engine.
    pub fn connect(&self) {
        let state = *self;
        let handlers = ws::Handlers {
            on_open: Rc::new(move |reconnected| {
                state.set_connection_lost.set(false);
                if !reconnected {
                    return;
                }
                let viewed = state.viewed();
                let mut commands = Vec::new();
                state
                    .set_engine
                    .update(|engine| commands = engine.reconnect_commands(viewed.as_deref()));
                for command in &commands {
                    state.send(command);
                }
                state.load_conversations();
            }),
            on_event: Rc::new(move |event| state.handle_event(event)),
            on_give_up: Rc::new(move |error| {
                state.set_connection_lost.set(true);
                state.report(error);
            }),
        };
        ws::connect(api::ws_url(api::USER_ID), handlers);
    }

    pub fn retry_connection(&self) {
        self.set_connection_lost.set(false);
        self.set_error.set(None);
        ws::retry();
    }

    fn handle_event(&self, event: ServerEvent) {
        let settled = matches!(event, ServerEvent::Pending { pending: false, .. });
        let viewed = self.viewed();
        let mut applied = Applied::default();
        self.set_engine
            .update(|engine| applied = engine.apply(event, viewed.as_deref()));

        if let Some(notice) = applied.notice {
            self.report(notice);
        }
        if applied.refresh {
            self.refresh_viewed();
        }
        // Finished replies bump conversation activity.
        if settled {
            self.load_conversations();
        }
    }

    /// Load conversations from the backend.
    pub fn load_conversations(&self) {
        let state = *self;
        spawn_local(async move {
            match api::fetch_conversations().await {
                Ok(convos) => state.set_conversations.set(convos),
                Err(e) => state.report(e),
            }
        });
    }

    /// Re-reads the viewed conversation and merges it into the display.
    pub fn refresh_viewed(&self) {
        let Some(id) = self.viewed() else {
            return;
        };
        let state = *self;
        spawn_local(async move {
            match api::fetch_messages(&id).await {
                Ok(msgs) => {
                    let mut lag = None;
                    state.set_engine.update(|engine| lag = engine.backfill(&id, &msgs));
                    if let Some(lag) = lag {
                        state.report(lag);
                    }
                }
                Err(e) => log::warn!("Backfill of {id} failed: {e}"),
            }
        });
    }

    pub fn start_backfill_timer(&self) {
        let state = *self;
        Interval::new(BACKFILL_INTERVAL_MS, move || state.refresh_viewed()).forget();
    }

    /// Switch the view to a conversation: load its history, then attach to
    /// any stream in flight there.
    pub fn select_conversation(&self, id: String) {
        if let Some(previous) = self.viewed().filter(|previous| *previous != id) {
            self.set_engine.update(|engine| engine.leave_conversation(&previous));
        }
        self.set_active_conversation.set(Some(id.clone()));
        self.set_error.set(None);

        let state = *self;
        spawn_local(async move {
            match api::fetch_messages(&id).await {
                // The user may have moved on while this was loading.
                Ok(msgs) if state.viewed().as_deref() == Some(id.as_str()) => {
                    let mut subscribe = None;
                    state
                        .set_engine
                        .update(|engine| subscribe = Some(engine.open_conversation(&id, &msgs)));
                    if let Some(command) = subscribe {
                        state.send(&command);
                    }
                }
                Ok(_) => {}
                Err(e) => state.report(e),
            }
        });
    }

    pub fn new_conversation(&self) {
        let state = *self;
        spawn_local(async move {
            match api::create_conversation(None).await {
                Ok(conversation) => {
                    let id = conversation.id.clone();
                    state.set_conversations.update(|list| list.insert(0, conversation));
                    state.select_conversation(id);
                }
                Err(e) => state.report(e),
            }
        });
    }

    /// Submit a message in the viewed conversation.
    pub fn send_message(&self, text: String) {
        let Some(id) = self.viewed() else {
            return;
        };
        self.set_error.set(None);

        let mut submitted = None;
        self.set_engine
            .update(|engine| submitted = Some(engine.submit(&id, &text)));
        match submitted {
            Some(Ok(command)) => self.send(&command),
            Some(Err(e)) => self.report(e),
            None => {}
        }
    }

    pub fn stop_generation(&self) {
        let Some(id) = self.viewed() else {
            return;
        };
        if let Some(command) = self.engine.with_untracked(|engine| engine.stop_command(&id)) {
            self.send(&command);
        }
    }
}
