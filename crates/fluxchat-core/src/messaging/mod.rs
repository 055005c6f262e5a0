//! Message records, dispatch, history, inbox and typing signals.

pub mod dispatcher;
pub mod history;
pub mod inbox;
pub mod message;
pub mod typing;

pub use dispatcher::MessageDispatcher;
pub use history::{ConversationHistory, HistoryWatch};
pub use inbox::InboxWorker;
pub use message::{ChatMessage, DeliveryMethod, MessageId, StoredMessage};
pub use typing::{TypingChannel, TypingSignal, TypingWatch};
