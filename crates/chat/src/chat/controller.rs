use std::sync::Arc;

use snafu::{Snafu, ensure};
use studymate_llm::{
    ProviderEventStream, ProviderMessage, ServiceError, ServiceErrorKind, StreamClient,
    StreamEvent, StreamEventPayload, StreamRequest, StreamTarget,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chat::message::{Conversation, Message, MessageId, Role};
use crate::chat::typing::{TypingScheduler, TypingState, TypingStep};
use crate::settings::SettingsStore;

pub const MISSING_API_KEY_NOTICE: &str = "The Gemini API key is not configured. \
Set GEMINI_API_KEY or API_KEY, or add `api_key` to the settings file.";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SubmitError {
    #[snafu(display("Please enter a question."))]
    EmptyInput { stage: &'static str },
    #[snafu(display("The question is {actual} characters long; the limit is {max}."))]
    InputTooLong {
        stage: &'static str,
        max: usize,
        actual: usize,
    },
}

/// Identifiers created by one accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub target: StreamTarget,
    pub user_message_id: MessageId,
    pub assistant_message_id: MessageId,
}

/// Coordinator-level stream metadata kept outside the conversation.
struct ActiveStream {
    target: StreamTarget,
    assistant_message_id: MessageId,
    /// `None` once the source reported completion.
    events: Option<ProviderEventStream>,
    worker: Option<JoinHandle<()>>,
}

enum Wake {
    Event(Option<StreamEvent>),
    Timer,
    Stalled,
}

/// Runs request/response cycles: owns the conversation, the typing scheduler and the one
/// in-flight stream.
pub struct ChatController {
    client: Arc<dyn StreamClient>,
    settings: Arc<SettingsStore>,
    conversation: Conversation,
    typing: TypingScheduler,
    active_stream: Option<ActiveStream>,
    next_target: StreamTarget,
    busy_tx: watch::Sender<bool>,
    notice: Option<String>,
}

impl ChatController {
    pub fn new(client: Arc<dyn StreamClient>, settings: Arc<SettingsStore>) -> Self {
        let typing = TypingScheduler::new(settings.settings().typing_delay());
        let notice = (!client.is_configured()).then(|| MISSING_API_KEY_NOTICE.to_string());
        let (busy_tx, _) = watch::channel(false);

        Self {
            client,
            settings,
            conversation: Conversation::new(),
            typing,
            active_stream: None,
            next_target: StreamTarget::new(1),
            busy_tx,
            notice,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Global error banner, e.g. missing credentials at startup.
    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn is_busy(&self) -> bool {
        *self.busy_tx.borrow()
    }

    pub fn subscribe_busy(&self) -> watch::Receiver<bool> {
        self.busy_tx.subscribe()
    }

    pub fn typing_state(&self) -> TypingState {
        self.typing.state()
    }

    pub fn active_message(&self) -> Option<MessageId> {
        self.active_stream
            .as_ref()
            .map(|active| active.assistant_message_id)
    }

    /// Starts a new cycle for `question`, cutting off any cycle still in flight.
    ///
    /// Must be called from within a tokio runtime; the client's worker is spawned on it.
    pub fn submit(&mut self, question: &str) -> Result<SubmitReceipt, SubmitError> {
        let question = question.trim();
        ensure!(
            !question.is_empty(),
            EmptyInputSnafu {
                stage: "submit-validate"
            }
        );

        let settings = self.settings.settings();
        let length = question.chars().count();
        ensure!(
            length <= settings.max_input_length,
            InputTooLongSnafu {
                stage: "submit-validate",
                max: settings.max_input_length,
                actual: length,
            }
        );

        self.cancel_active_stream();
        self.typing.set_pacing(settings.typing_delay());
        self.notice = None;

        let user_message_id = self.conversation.push(Message::user(question));
        let request_messages = Self::build_provider_messages(&self.conversation);
        let assistant_message_id = self.conversation.push(Message::assistant_placeholder());

        let target = self.next_target;
        // Reserve the next target immediately so follow-up submissions never reuse one.
        self.next_target = target.next();

        self.typing.begin(target, assistant_message_id);
        self.active_stream = Some(ActiveStream {
            target,
            assistant_message_id,
            events: None,
            worker: None,
        });
        self.set_busy(true);

        let request = StreamRequest::new(target, settings.model_id.clone(), request_messages)
            .with_system_instruction(settings.system_instruction.clone());

        tracing::info!(
            target = ?target,
            message_id = %assistant_message_id,
            model_id = %settings.model_id,
            history_len = request.messages.len(),
            "submitting question"
        );

        match self.client.stream_chat(request) {
            Ok(handle) => {
                if let Some(active) = self.active_stream.as_mut() {
                    active.events = Some(handle.stream);
                    active.worker = Some(tokio::spawn(handle.worker));
                }
            }
            Err(error) => {
                let error = error.into_service_error();
                tracing::error!(
                    target = ?target,
                    provider_id = %self.client.id(),
                    kind = ?error.kind,
                    error = %error,
                    "failed to start provider stream"
                );
                self.fail_active_stream(target, error);
            }
        }

        Ok(SubmitReceipt {
            target,
            user_message_id,
            assistant_message_id,
        })
    }

    /// Empties the conversation and drops any in-flight cycle.
    pub fn clear(&mut self) {
        self.cancel_active_stream();
        self.conversation.clear();
        self.notice = None;
        self.set_busy(false);
    }

    /// Applies one event from the stream client.
    pub fn handle_stream_event(&mut self, event: StreamEvent) {
        if !self.stream_event_is_current(event.target) {
            tracing::debug!(target = ?event.target, "dropping event for an inactive stream");
            return;
        }

        match event.payload {
            StreamEventPayload::Fragment(text) => {
                let step = self.typing.push_fragment(event.target, &text);
                self.apply_typing_step(step);
            }
            StreamEventPayload::Done => {
                if let Some(active) = self.active_stream.as_mut() {
                    active.events = None;
                    active.worker = None;
                }
                let step = self.typing.mark_exhausted(event.target);
                self.apply_typing_step(step);
            }
            StreamEventPayload::Error(error) => {
                self.fail_active_stream(event.target, error);
            }
        }
    }

    /// Handles the pacing timer firing.
    pub fn on_timer(&mut self) {
        let step = self.typing.fire_timer();
        self.apply_typing_step(step);
    }

    /// Waits for the next stream event or timer fire and applies it.
    ///
    /// Returns `false` when no cycle is in flight.
    pub async fn step(&mut self) -> bool {
        let deadline = self.typing.deadline();
        let Some(active) = self.active_stream.as_mut() else {
            return false;
        };
        let target = active.target;

        let wake = match (active.events.as_mut(), deadline) {
            (Some(events), Some(deadline)) => tokio::select! {
                biased;
                event = events.recv() => Wake::Event(event),
                _ = tokio::time::sleep_until(deadline) => Wake::Timer,
            },
            (Some(events), None) => Wake::Event(events.recv().await),
            (None, Some(deadline)) => {
                tokio::time::sleep_until(deadline).await;
                Wake::Timer
            }
            (None, None) => Wake::Stalled,
        };

        match wake {
            Wake::Event(Some(event)) => self.handle_stream_event(event),
            Wake::Event(None) => self.handle_stream_closed(target),
            Wake::Timer => self.on_timer(),
            Wake::Stalled => {
                tracing::warn!(target = ?target, "typing stalled without input or timer");
                self.fail_active_stream(
                    target,
                    ServiceError::new(ServiceErrorKind::Unknown, "typing stalled"),
                );
            }
        }
        true
    }

    /// Drives the current cycle until it finalizes or fails.
    pub async fn run_until_idle(&mut self) {
        while self.step().await {}
    }

    fn stream_event_is_current(&self, target: StreamTarget) -> bool {
        self.active_stream
            .as_ref()
            .is_some_and(|active| active.target == target)
    }

    fn handle_stream_closed(&mut self, target: StreamTarget) {
        if !self.stream_event_is_current(target) {
            return;
        }

        tracing::warn!(target = ?target, "provider stream closed without a terminal event");
        self.fail_active_stream(
            target,
            ServiceError::new(
                ServiceErrorKind::Unknown,
                "stream ended before completion",
            ),
        );
    }

    fn apply_typing_step(&mut self, step: TypingStep) {
        match step {
            TypingStep::Append { message_id, ch } => {
                self.conversation.append_char(message_id, ch);
            }
            TypingStep::Finalize { message_id } => {
                self.conversation.finish(message_id);
                self.active_stream = None;
                self.set_busy(false);
                tracing::info!(message_id = %message_id, "assistant message finalized");
            }
            TypingStep::Pending | TypingStep::Stale => {}
        }
    }

    fn fail_active_stream(&mut self, target: StreamTarget, error: ServiceError) {
        let Some(active) = self
            .active_stream
            .take_if(|active| active.target == target)
        else {
            return;
        };

        self.typing.cancel();
        if let Some(worker) = active.worker {
            worker.abort();
        }

        tracing::warn!(
            target = ?target,
            message_id = %active.assistant_message_id,
            kind = ?error.kind,
            error = %error,
            "assistant message failed"
        );
        self.conversation
            .fail(active.assistant_message_id, error.user_message());
        self.set_busy(false);
    }

    /// Leaves the busy flag to the caller so a resubmit never reports idle in between.
    fn cancel_active_stream(&mut self) {
        let Some(active) = self.active_stream.take() else {
            return;
        };

        // Dropping the event stream signals cancellation to the provider worker.
        self.typing.cancel();
        if let Some(worker) = active.worker {
            worker.abort();
        }

        self.conversation.cancel(active.assistant_message_id);
        tracing::debug!(
            target = ?active.target,
            message_id = %active.assistant_message_id,
            "cancelled in-flight stream"
        );
    }

    fn set_busy(&self, busy: bool) {
        self.busy_tx.send_if_modified(|current| {
            if *current == busy {
                return false;
            }
            *current = busy;
            true
        });
    }

    fn build_provider_messages(conversation: &Conversation) -> Vec<ProviderMessage> {
        conversation
            .messages()
            .iter()
            // Failed placeholders carry no content and are not part of the model context.
            .filter(|message| !message.content.is_empty())
            .map(|message| match message.role {
                Role::User => ProviderMessage::user(message.content.clone()),
                Role::Assistant => ProviderMessage::model(message.content.clone()),
            })
            .collect()
    }
}
