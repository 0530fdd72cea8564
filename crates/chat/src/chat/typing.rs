use std::collections::VecDeque;
use std::time::Duration;

use studymate_llm::StreamTarget;
use tokio::time::Instant;

use crate::chat::message::MessageId;

/// Observable phase of the typewriter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypingState {
    /// No assistant message is being typed.
    Idle,
    /// A character was just typed and the pacing timer is armed.
    Draining,
    /// Queue is empty and more fragments are expected; no timer is armed.
    Waiting,
    /// Queue is empty and the source is exhausted; the next wake-up finalizes.
    Finalizing,
}

/// Mutation the owner of the conversation must apply after driving the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingStep {
    /// Nothing to apply until the next fragment or timer fire.
    Pending,
    Append { message_id: MessageId, ch: char },
    /// The message is complete; the scheduler is back to idle.
    Finalize { message_id: MessageId },
    /// Input addressed a stream that is no longer active.
    Stale,
}

/// Per-request buffering state. Exists only while a submission is in flight.
#[derive(Debug)]
struct PendingStream {
    target: StreamTarget,
    message_id: MessageId,
    queue: VecDeque<char>,
    source_exhausted: bool,
    deadline: Option<Instant>,
}

/// Paces buffered fragments into one assistant message, one character per tick.
///
/// The scheduler never touches the conversation itself; every call returns a [`TypingStep`]
/// for the caller to apply. Timer state is an explicit deadline, so a cancelled or replaced
/// stream leaves nothing behind that could fire later.
#[derive(Debug)]
pub struct TypingScheduler {
    pacing: Duration,
    pending: Option<PendingStream>,
}

impl TypingScheduler {
    pub fn new(pacing: Duration) -> Self {
        Self {
            pacing,
            pending: None,
        }
    }

    pub fn set_pacing(&mut self, pacing: Duration) {
        self.pacing = pacing;
    }

    pub fn state(&self) -> TypingState {
        match &self.pending {
            None => TypingState::Idle,
            Some(pending) if pending.queue.is_empty() && pending.source_exhausted => {
                TypingState::Finalizing
            }
            Some(pending) if pending.deadline.is_some() => TypingState::Draining,
            Some(_) => TypingState::Waiting,
        }
    }

    pub fn active_message(&self) -> Option<MessageId> {
        self.pending.as_ref().map(|pending| pending.message_id)
    }

    /// When the armed pacing timer is due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().and_then(|pending| pending.deadline)
    }

    pub fn queued_chars(&self) -> usize {
        self.pending
            .as_ref()
            .map(|pending| pending.queue.len())
            .unwrap_or(0)
    }

    /// Starts typing into `message_id`. Any previous stream is dropped first.
    ///
    /// Returns the message that was being typed before, if one was cut off.
    pub fn begin(&mut self, target: StreamTarget, message_id: MessageId) -> Option<MessageId> {
        let previous = self.cancel();
        self.pending = Some(PendingStream {
            target,
            message_id,
            queue: VecDeque::new(),
            source_exhausted: false,
            deadline: None,
        });
        previous
    }

    /// Queues every character of `fragment` and types one right away if no timer is armed.
    pub fn push_fragment(&mut self, target: StreamTarget, fragment: &str) -> TypingStep {
        let Some(pending) = self.pending_for(target) else {
            return TypingStep::Stale;
        };

        pending.queue.extend(fragment.chars());
        if pending.deadline.is_some() {
            return TypingStep::Pending;
        }
        self.drain()
    }

    /// Records that the source delivered its last fragment.
    pub fn mark_exhausted(&mut self, target: StreamTarget) -> TypingStep {
        let Some(pending) = self.pending_for(target) else {
            return TypingStep::Stale;
        };

        pending.source_exhausted = true;
        if pending.deadline.is_some() {
            return TypingStep::Pending;
        }
        self.drain()
    }

    /// Handles the pacing timer firing.
    pub fn fire_timer(&mut self) -> TypingStep {
        let Some(pending) = self.pending.as_mut() else {
            return TypingStep::Stale;
        };

        pending.deadline = None;
        self.drain()
    }

    /// Drops the queue, the armed timer and the active message in one step.
    pub fn cancel(&mut self) -> Option<MessageId> {
        self.pending.take().map(|pending| pending.message_id)
    }

    fn pending_for(&mut self, target: StreamTarget) -> Option<&mut PendingStream> {
        self.pending
            .as_mut()
            .filter(|pending| pending.target == target)
    }

    fn drain(&mut self) -> TypingStep {
        let Some(pending) = self.pending.as_mut() else {
            return TypingStep::Stale;
        };

        if let Some(ch) = pending.queue.pop_front() {
            pending.deadline = Some(Instant::now() + self.pacing);
            return TypingStep::Append {
                message_id: pending.message_id,
                ch,
            };
        }

        if pending.source_exhausted {
            let message_id = pending.message_id;
            self.pending = None;
            return TypingStep::Finalize { message_id };
        }

        TypingStep::Pending
    }
}
