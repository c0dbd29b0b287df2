//! Wire protocol and chat data model shared between the daemon and its
//! front-end.
//!
//! The front-end spawns the daemon as a child process and both sides exchange
//! newline-delimited JSON: requests carry an `action` discriminator, responses
//! a `type` discriminator, and each response echoes the caller's `request_id`
//! when one was supplied.

mod config_types;
mod model;
mod wire;

pub use config_types::DiffMode;
pub use config_types::ReasoningEffort;
pub use model::Chat;
pub use model::ContextAction;
pub use model::ContextEvent;
pub use model::ContextFile;
pub use model::Message;
pub use model::MessagePart;
pub use model::Role;
pub use model::Usage;
pub use wire::Action;
pub use wire::ActionClass;
pub use wire::ClientRequest;
pub use wire::OutgoingLine;
pub use wire::RequestId;
pub use wire::RetryContext;
pub use wire::ServerResponse;
pub use wire::ToolCallRecord;
