#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chat_stream_sync::agent::{
    GenerationEvent, GenerationRequest, GenerationService, GenerationStream,
};
use chat_stream_sync::config::StreamSettings;
use chat_stream_sync::db::{InMemoryMessageStore, MessageStore};
use chat_stream_sync::errors::AppError;
use chat_stream_sync::protocol::ServerEvent;
use chat_stream_sync::service::chat_service::ChatService;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// One generation started by the service, steered by the test.
pub struct GenerationControl {
    pub request: GenerationRequest,
    pub events: mpsc::UnboundedSender<GenerationEvent>,
    pub cancel: CancellationToken,
}

impl GenerationControl {
    pub fn delta(&self, text: &str) {
        self.events
            .send(GenerationEvent::Delta { text: text.to_string() })
            .expect("generation stream dropped");
    }

    pub fn done(&self) {
        self.events.send(GenerationEvent::Done).expect("generation stream dropped");
    }

    pub fn fail(&self, message: &str) {
        self.events
            .send(GenerationEvent::Failed { message: message.to_string() })
            .expect("generation stream dropped");
    }
}

/// Generation Service double: each `begin_generation` hands a control
/// handle to the test instead of calling a model.
pub struct ControlledGeneration {
    started: mpsc::UnboundedSender<GenerationControl>,
    honor_cancel: bool,
    refuse: bool,
}

impl ControlledGeneration {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GenerationControl>) {
        let (started, rx) = mpsc::unbounded_channel();
        (Self { started, honor_cancel: true, refuse: false }, rx)
    }

    /// A generation that keeps going after being asked to stop.
    pub fn ignoring_cancel() -> (Self, mpsc::UnboundedReceiver<GenerationControl>) {
        let (mut generation, rx) = Self::new();
        generation.honor_cancel = false;
        (generation, rx)
    }

    /// A generation service that cannot start at all.
    pub fn unavailable() -> (Self, mpsc::UnboundedReceiver<GenerationControl>) {
        let (mut generation, rx) = Self::new();
        generation.refuse = true;
        (generation, rx)
    }
}

#[async_trait]
impl GenerationService for ControlledGeneration {
    async fn begin_generation(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationStream, AppError> {
        if self.refuse {
            return Err(AppError::OllamaUnavailable { host: "test".to_string() });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.started.send(GenerationControl {
            request,
            events: tx,
            cancel: cancel.clone(),
        });

        let honor_cancel = self.honor_cancel;
        Ok(stream::unfold(Some((rx, cancel)), move |state| async move {
            let (mut rx, cancel) = state?;
            tokio::select! {
                biased;
                event = rx.recv() => {
                    let event = event?;
                    let next = (!event.is_terminal()).then_some((rx, cancel));
                    Some((event, next))
                }
                _ = cancel.cancelled(), if honor_cancel => Some((GenerationEvent::Done, None)),
            }
        })
        .boxed())
    }
}

pub struct Harness {
    pub svc: ChatService,
    pub store: Arc<InMemoryMessageStore>,
    pub generations: mpsc::UnboundedReceiver<GenerationControl>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(ControlledGeneration::new(), StreamSettings::default())
    }

    pub fn with(
        (generation, generations): (ControlledGeneration, mpsc::UnboundedReceiver<GenerationControl>),
        settings: StreamSettings,
    ) -> Self {
        let store = Arc::new(InMemoryMessageStore::new());
        let svc = ChatService::new(store.clone(), Arc::new(generation), settings);
        Self { svc, store, generations }
    }

    pub async fn conversation(&self) -> String {
        self.store.create_conversation("test").await.unwrap().id
    }

    pub async fn next_generation(&mut self) -> GenerationControl {
        tokio::time::timeout(EVENT_TIMEOUT, self.generations.recv())
            .await
            .expect("timed out waiting for a generation to start")
            .expect("generation service dropped")
    }

    pub async fn assistant_messages(&self, conversation_id: &str) -> Vec<(String, String)> {
        self.store
            .list_messages(conversation_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.role == chat_stream_sync::models::MessageRole::Assistant)
            .map(|m| (m.id, m.content))
            .collect()
    }
}

pub async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a server event")
        .expect("connection channel closed")
}

/// Next event that is not a `pending` flag update.
pub async fn next_stream_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    loop {
        match next_event(rx).await {
            ServerEvent::Pending { .. } => continue,
            event => return event,
        }
    }
}

pub fn pending(conversation_id: &str, pending: bool) -> ServerEvent {
    ServerEvent::Pending { conversation_id: conversation_id.to_string(), pending }
}
