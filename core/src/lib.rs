//! Root of the `bb7-core` library: the chat-turn engine behind the daemon.

// Prevent accidental direct writes to stdout/stderr in library code. Stdout
// is the wire; everything else goes through the tracing stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod client;
pub mod config;
pub mod error;
pub mod fingerprint;
mod flags;
pub mod outgoing;
pub mod prompt;
pub mod registry;
pub mod state;
pub mod title;
pub mod tools;
pub mod turn;

pub use client::CompletionRequest;
pub use client::CompletionTransport;
pub use client::EventStream;
pub use client::HttpTransport;
pub use client::StreamEvent;
pub use config::Config;
pub use error::Bb7Err;
pub use error::Result;
pub use fingerprint::file_fingerprint;
pub use outgoing::OutgoingSender;
pub use registry::StreamRegistry;
pub use state::AppState;
pub use state::MemoryStateStore;
pub use state::StateStore;
pub use turn::ABORT_MESSAGE;
pub use turn::SendArgs;
pub use turn::TurnContext;
pub use turn::run_send_turn;
