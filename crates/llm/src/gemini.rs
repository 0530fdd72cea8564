use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::gemini;
use rig::streaming::{StreamedAssistantContent, StreamingCompletionResponse};
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use crate::error::ServiceError;
use crate::provider::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, MissingApiKeySnafu,
    ProviderConfig, ProviderError, ProviderMessage, ProviderResult, ProviderStreamHandle,
    ProviderWorker, Role, StreamClient, StreamEvent, StreamRequest, StreamTarget,
    make_event_stream,
};

pub const GEMINI_PROVIDER_ID: &str = "gemini";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

pub struct GeminiStreamClient {
    config: ProviderConfig,
}

impl GeminiStreamClient {
    pub fn new(config: ProviderConfig) -> Self {
        if !config.has_api_key() {
            tracing::warn!(
                provider_id = %config.provider_id,
                "gemini client created without an API key; requests will fail"
            );
        }

        Self { config }
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<gemini::Client> {
        let mut builder = gemini::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.text.clone()),
            Role::Model => RigMessage::assistant(message.text.clone()),
        }
    }

    async fn open_stream<M>(
        model: M,
        request: &StreamRequest,
    ) -> ProviderResult<StreamingCompletionResponse<M::StreamingResponse>>
    where
        M: CompletionModel,
    {
        let mut messages = request
            .messages
            .iter()
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        // The newest turn is the prompt; everything before it is chat history.
        let Some(prompt) = messages.pop() else {
            tracing::error!(
                target = ?request.target,
                model_id = %request.model_id,
                "message list became empty before prompt extraction"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                target: request.target,
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(instruction) = &request.system_instruction {
            builder = builder.preamble(instruction.clone());
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEvent>,
        target: StreamTarget,
        error: ServiceError,
    ) {
        let _ = event_tx.send(StreamEvent::error(target, error));
    }

    fn map_stream_item<R>(
        target: StreamTarget,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEvent>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEvent::fragment(target, text.text))
            }
            // Reasoning, tool calls and the final usage summary never reach the transcript.
            _ => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;
        let opened = match Self::build_client(&config) {
            Ok(client) => {
                let model = client.completion_model(request.model_id.clone());
                Self::open_stream(model, &request).await
            }
            Err(error) => Err(error),
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                let error = error.into_service_error();
                tracing::error!(
                    target = ?target,
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    kind = ?error.kind,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, target, error);
                return;
            }
        };

        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    tracing::debug!(target = ?target, "provider stream cancelled");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(target, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            }
                            .into_service_error();
                            tracing::warn!(
                                target = ?target,
                                kind = ?error.kind,
                                error = %error,
                                "provider stream emitted an error chunk"
                            );
                            Self::emit_error_event(&event_tx, target, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEvent::done(target));
        }
    }
}

impl StreamClient for GeminiStreamClient {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn is_configured(&self) -> bool {
        self.config.has_api_key()
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            self.config.has_api_key(),
            MissingApiKeySnafu {
                stage: "stream-chat",
                provider_id: self.config.provider_id.clone(),
            }
        );
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                target: request.target,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}
