use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn id_prefix(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "ai",
        }
    }
}

/// Stable identifier for one message.
///
/// Backed by a time-ordered UUIDv7; the role prefix only shows up in `Display`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    role: Role,
    raw: Uuid,
}

impl MessageId {
    pub fn new_v7(role: Role) -> Self {
        Self {
            role,
            raw: Uuid::now_v7(),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}-{}", self.role.id_prefix(), self.raw)
    }
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Done,
    /// The typewriter is still appending characters.
    Streaming,
    Failed(String),
    /// Superseded by a newer submission before it finished typing.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            id: MessageId::new_v7(role),
            role,
            content: content.into(),
            created_at: Utc::now(),
            status,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, MessageStatus::Done)
    }

    /// Creates the empty assistant placeholder filled in by the typewriter.
    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, String::new(), MessageStatus::Streaming)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.status, MessageStatus::Streaming)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, MessageStatus::Failed(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.status {
            MessageStatus::Failed(message) => Some(message),
            MessageStatus::Done | MessageStatus::Streaming | MessageStatus::Cancelled => None,
        }
    }
}

/// Ordered conversation log; insertion order is display order and model context order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn push(&mut self, message: Message) -> MessageId {
        let id = message.id;
        self.messages.push(message);
        id
    }

    /// Appends one typed character. Only a streaming message accepts characters.
    pub fn append_char(&mut self, id: MessageId, ch: char) -> bool {
        match self.get_mut(id) {
            Some(message) if message.is_streaming() => {
                message.content.push(ch);
                true
            }
            _ => false,
        }
    }

    pub fn finish(&mut self, id: MessageId) -> bool {
        self.transition_streaming(id, MessageStatus::Done)
    }

    pub fn cancel(&mut self, id: MessageId) -> bool {
        self.transition_streaming(id, MessageStatus::Cancelled)
    }

    /// Marks a message failed and drops whatever was typed so far.
    pub fn fail(&mut self, id: MessageId, error_message: impl Into<String>) -> bool {
        let Some(message) = self.get_mut(id) else {
            return false;
        };

        message.content.clear();
        message.status = MessageStatus::Failed(error_message.into());
        true
    }

    pub fn streaming_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.is_streaming())
            .count()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    fn get_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| message.id == id)
    }

    fn transition_streaming(&mut self, id: MessageId, status: MessageStatus) -> bool {
        match self.get_mut(id) {
            Some(message) if message.is_streaming() => {
                message.status = status;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_role_prefix() {
        let user = Message::user("hi");
        let assistant = Message::assistant_placeholder();

        assert!(user.id.to_string().starts_with("user-"));
        assert!(assistant.id.to_string().starts_with("ai-"));
        assert_ne!(user.id, assistant.id);
    }

    #[test]
    fn only_streaming_messages_accept_characters() {
        let mut conversation = Conversation::new();
        let user_id = conversation.push(Message::user("question"));
        let assistant_id = conversation.push(Message::assistant_placeholder());

        assert!(!conversation.append_char(user_id, 'x'));
        assert!(conversation.append_char(assistant_id, 'o'));
        assert!(conversation.append_char(assistant_id, 'k'));
        assert!(conversation.finish(assistant_id));
        assert!(!conversation.append_char(assistant_id, '!'));

        assert_eq!(
            conversation.get(user_id).map(|m| m.content.as_str()),
            Some("question")
        );
        assert_eq!(
            conversation.get(assistant_id).map(|m| m.content.as_str()),
            Some("ok")
        );
    }

    #[test]
    fn failing_replaces_content_and_records_message() {
        let mut conversation = Conversation::new();
        let id = conversation.push(Message::assistant_placeholder());
        conversation.append_char(id, 'p');

        assert!(conversation.fail(id, "quota exceeded"));

        let message = conversation.get(id).expect("message");
        assert!(message.content.is_empty());
        assert!(message.is_failed());
        assert!(!message.is_streaming());
        assert_eq!(message.error_message(), Some("quota exceeded"));
    }

    #[test]
    fn cancel_keeps_partial_content() {
        let mut conversation = Conversation::new();
        let id = conversation.push(Message::assistant_placeholder());
        conversation.append_char(id, 'a');

        assert!(conversation.cancel(id));
        assert_eq!(conversation.streaming_count(), 0);
        assert_eq!(conversation.get(id).map(|m| m.content.as_str()), Some("a"));
        assert_eq!(
            conversation.get(id).map(|m| &m.status),
            Some(&MessageStatus::Cancelled)
        );
    }
}
