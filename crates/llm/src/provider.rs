use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ServiceError, ServiceErrorKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Identifier for one streaming generation session.
///
/// Every submission gets a fresh target so events from an abandoned stream can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamTarget(pub u64);

impl StreamTarget {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Speaker of one turn as the remote service names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub text: String,
}

impl ProviderMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub system_instruction: Option<String>,
}

impl StreamRequest {
    pub fn new(
        target: StreamTarget,
        model_id: impl Into<String>,
        messages: Vec<ProviderMessage>,
    ) -> Self {
        Self {
            target,
            model_id: model_id.into(),
            messages,
            system_instruction: None,
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        let instruction = instruction.into();
        if !instruction.trim().is_empty() {
            self.system_instruction = Some(instruction);
        }
        self
    }
}

/// Stream payload mapped out of provider-specific chunk types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Fragment(String),
    Done,
    Error(ServiceError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

impl StreamEvent {
    pub fn fragment(target: StreamTarget, text: impl Into<String>) -> Self {
        Self {
            target,
            payload: StreamEventPayload::Fragment(text.into()),
        }
    }

    pub fn done(target: StreamTarget) -> Self {
        Self {
            target,
            payload: StreamEventPayload::Done,
        }
    }

    pub fn error(target: StreamTarget, error: ServiceError) -> Self {
        Self {
            target,
            payload: StreamEventPayload::Error(error),
        }
    }
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for {target:?} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

impl ProviderError {
    /// Normalizes a provider failure into the service taxonomy shown to users.
    pub fn into_service_error(self) -> ServiceError {
        match self {
            Self::MissingApiKey { .. } | Self::UnsupportedProvider { .. } => {
                ServiceError::new(ServiceErrorKind::Config, self.to_string())
            }
            Self::EmptyMessageSet { .. } => {
                ServiceError::new(ServiceErrorKind::EmptyHistory, self.to_string())
            }
            Self::HttpClient { source, .. } => ServiceError::classify(&source.to_string()),
            Self::CompletionsFailed { source, .. } => ServiceError::classify(&source.to_string()),
        }
    }
}

pub struct ProviderEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Remote text generation service that streams a reply for a conversation.
pub trait StreamClient: Send + Sync {
    fn id(&self) -> &str;

    /// Returns false when credentials are absent and every request would fail up front.
    fn is_configured(&self) -> bool;

    /// Starts one request. An `Err` means nothing was sent; otherwise the worker must be
    /// spawned and reports exactly one terminal event unless cancelled.
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Builds the channel pair shared by every `StreamClient` implementation.
pub fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEvent>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_maps_to_config_error() {
        let error = ProviderError::MissingApiKey {
            stage: "test",
            provider_id: "gemini".to_string(),
        };

        assert_eq!(error.into_service_error().kind, ServiceErrorKind::Config);
    }

    #[test]
    fn empty_message_set_maps_to_empty_history() {
        let error = ProviderError::EmptyMessageSet {
            stage: "test",
            target: StreamTarget::new(3),
        };

        assert_eq!(
            error.into_service_error().kind,
            ServiceErrorKind::EmptyHistory
        );
    }

    #[test]
    fn blank_system_instruction_is_dropped() {
        let request = StreamRequest::new(
            StreamTarget::new(1),
            "m",
            vec![ProviderMessage::user("hi")],
        )
        .with_system_instruction("   ");

        assert_eq!(request.system_instruction, None);
    }

    #[tokio::test]
    async fn dropping_event_stream_signals_cancel() {
        let (_event_tx, stream, cancel_rx) = make_event_stream(StreamTarget::new(1));
        drop(stream);

        assert!(cancel_rx.await.is_ok());
    }

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let target = StreamTarget::new(7);
        let (event_tx, mut stream, _cancel_rx) = make_event_stream(target);
        event_tx.send(StreamEvent::fragment(target, "a")).unwrap();
        event_tx.send(StreamEvent::done(target)).unwrap();
        drop(event_tx);

        assert_eq!(stream.recv().await, Some(StreamEvent::fragment(target, "a")));
        assert_eq!(stream.recv().await, Some(StreamEvent::done(target)));
        assert_eq!(stream.recv().await, None);
    }
}
