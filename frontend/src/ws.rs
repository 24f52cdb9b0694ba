//! The app's single websocket to the gateway.
//!
//! The socket lives in a thread-local so commands can be sent from any event
//! handler. A dropped or stalled socket is replaced with exponential backoff;
//! callers only hear about it once the retry budget is spent.

use std::cell::RefCell;
use std::rc::Rc;

use gloo_timers::callback::Timeout;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{CloseEvent, MessageEvent, WebSocket};

use crate::errors::ClientError;
use crate::models::{ClientCommand, ServerEvent};

pub const MAX_RECONNECT_ATTEMPTS: u32 = 8;
const BASE_DELAY_MS: u32 = 500;
const MAX_DELAY_MS: u32 = 10_000;
const HANDSHAKE_TIMEOUT_MS: u32 = 5_000;

/// Delay before reconnect attempt `attempt` (0-based): 500 ms doubling, capped at 10 s.
pub fn reconnect_delay(attempt: u32) -> u32 {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    BASE_DELAY_MS.saturating_mul(factor).min(MAX_DELAY_MS)
}

/// Callbacks invoked from socket events. Never called while the connection
/// state is borrowed, so they may call back into this module.
#[derive(Clone)]
pub struct Handlers {
    /// Socket is open; `true` when it replaces an earlier one.
    pub on_open: Rc<dyn Fn(bool)>,
    pub on_event: Rc<dyn Fn(ServerEvent)>,
    pub on_give_up: Rc<dyn Fn(ClientError)>,
}

struct Connection {
    url: String,
    handlers: Handlers,
    socket: Option<WebSocket>,
    /// Bumped per socket so callbacks from a replaced socket are ignored.
    epoch: u64,
    attempt: u32,
    ever_opened: bool,
    outbox: Vec<String>,
}

thread_local! {
    static CONNECTION: RefCell<Option<Connection>> = const { RefCell::new(None) };
}

enum Next {
    Retry(u32),
    GiveUp(Rc<dyn Fn(ClientError)>),
}

/// Opens the connection. Calling it again replaces the previous one.
pub fn connect(url: String, handlers: Handlers) {
    let previous = CONNECTION.with(|c| {
        let mut guard = c.borrow_mut();
        let epoch = guard.as_ref().map_or(0, |old| old.epoch);
        guard
            .replace(Connection {
                url,
                handlers,
                socket: None,
                epoch,
                attempt: 0,
                ever_opened: false,
                outbox: Vec::new(),
            })
            .and_then(|old| old.socket)
    });
    if let Some(socket) = previous {
        let _ = socket.close();
    }
    open();
}

/// Sends a command now, or once the socket is open again.
pub fn send(command: &ClientCommand) -> Result<(), ClientError> {
    let json = serde_json::to_string(command).map_err(|e| ClientError::Network(e.to_string()))?;
    CONNECTION.with(|c| {
        let mut guard = c.borrow_mut();
        let Some(conn) = guard.as_mut() else {
            return Err(ClientError::Network("not connected".to_string()));
        };
        match &conn.socket {
            Some(ws) if ws.ready_state() == WebSocket::OPEN => ws
                .send_with_str(&json)
                .map_err(|e| ClientError::Network(format!("{e:?}"))),
            _ => {
                conn.outbox.push(json);
                Ok(())
            }
        }
    })
}

/// Starts over with a fresh retry budget after the client gave up.
pub fn retry() {
    CONNECTION.with(|c| {
        if let Some(conn) = c.borrow_mut().as_mut() {
            conn.attempt = 0;
        }
    });
    open();
}

fn open() {
    let Some((url, epoch)) = CONNECTION.with(|c| {
        c.borrow_mut().as_mut().map(|conn| {
            conn.epoch += 1;
            (conn.url.clone(), conn.epoch)
        })
    }) else {
        return;
    };

    let ws = match WebSocket::new(&url) {
        Ok(ws) => ws,
        Err(e) => {
            log::error!("Failed to open websocket: {e:?}");
            schedule_reconnect(epoch);
            return;
        }
    };

    // --- onopen: flush queued commands, then notify ---
    let onopen = Closure::<dyn Fn()>::new(move || {
        let opened = CONNECTION.with(|c| {
            let mut guard = c.borrow_mut();
            let conn = guard.as_mut().filter(|conn| conn.epoch == epoch)?;
            let reconnected = conn.ever_opened;
            conn.ever_opened = true;
            conn.attempt = 0;
            if let Some(ws) = &conn.socket {
                for json in conn.outbox.drain(..) {
                    let _ = ws.send_with_str(&json);
                }
            }
            Some((conn.handlers.on_open.clone(), reconnected))
        });
        if let Some((on_open, reconnected)) = opened {
            log::info!("Websocket open (reconnected: {reconnected})");
            on_open(reconnected);
        }
    });
    ws.set_onopen(Some(onopen.as_ref().unchecked_ref()));
    onopen.forget();

    // --- onmessage: decode ServerEvent ---
    let onmessage = Closure::<dyn Fn(MessageEvent)>::new(move |ev: MessageEvent| {
        let Some(text) = ev.data().as_string() else {
            return;
        };
        let Some(on_event) = handler(epoch, |h| h.on_event.clone()) else {
            return;
        };
        match serde_json::from_str::<ServerEvent>(&text) {
            Ok(event) => on_event(event),
            Err(e) => log::warn!("Ignoring undecodable frame: {e}"),
        }
    });
    ws.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
    onmessage.forget();

    // --- onclose: replace the socket ---
    let onclose = Closure::<dyn Fn(CloseEvent)>::new(move |ev: CloseEvent| {
        let current = CONNECTION.with(|c| {
            let mut guard = c.borrow_mut();
            match guard.as_mut().filter(|conn| conn.epoch == epoch) {
                Some(conn) => {
                    conn.socket = None;
                    true
                }
                None => false,
            }
        });
        if current {
            log::warn!("Websocket closed (code {})", ev.code());
            schedule_reconnect(epoch);
        }
    });
    ws.set_onclose(Some(onclose.as_ref().unchecked_ref()));
    onclose.forget();

    let onerror = Closure::<dyn Fn()>::new(move || {
        log::error!("WebSocket connection error");
    });
    ws.set_onerror(Some(onerror.as_ref().unchecked_ref()));
    onerror.forget();

    // A handshake that never completes is treated like a drop.
    let pending = ws.clone();
    Timeout::new(HANDSHAKE_TIMEOUT_MS, move || {
        if pending.ready_state() == WebSocket::CONNECTING {
            log::warn!("Websocket handshake timed out");
            let _ = pending.close();
        }
    })
    .forget();

    CONNECTION.with(|c| {
        if let Some(conn) = c.borrow_mut().as_mut().filter(|conn| conn.epoch == epoch) {
            conn.socket = Some(ws);
        }
    });
}

fn handler<T>(epoch: u64, pick: impl FnOnce(&Handlers) -> T) -> Option<T> {
    CONNECTION.with(|c| {
        c.borrow()
            .as_ref()
            .filter(|conn| conn.epoch == epoch)
            .map(|conn| pick(&conn.handlers))
    })
}

fn schedule_reconnect(epoch: u64) {
    let next = CONNECTION.with(|c| {
        let mut guard = c.borrow_mut();
        let conn = guard.as_mut().filter(|conn| conn.epoch == epoch)?;
        if conn.attempt >= MAX_RECONNECT_ATTEMPTS {
            return Some(Next::GiveUp(conn.handlers.on_give_up.clone()));
        }
        let delay = reconnect_delay(conn.attempt);
        conn.attempt += 1;
        Some(Next::Retry(delay))
    });

    match next {
        Some(Next::Retry(delay)) => {
            log::info!("Reconnecting in {delay} ms");
            Timeout::new(delay, open).forget();
        }
        Some(Next::GiveUp(on_give_up)) => {
            on_give_up(ClientError::Transport { attempts: MAX_RECONNECT_ATTEMPTS });
        }
        None => {}
    }
}
