/// Submission controller wiring the stream client into the typewriter.
pub mod controller;
/// Conversation entities.
pub mod message;
pub mod typing;

pub use controller::{ChatController, MISSING_API_KEY_NOTICE, SubmitError, SubmitReceipt};
pub use message::{Conversation, Message, MessageId, MessageStatus, Role};
pub use typing::{TypingScheduler, TypingState, TypingStep};
