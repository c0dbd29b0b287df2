//! Fire-and-forget title generation for a chat's first exchange.
//!
//! Runs as an independent task after the turn has already answered `done`;
//! the resulting `title_updated` notification is advisory and carries no
//! ordering guarantee relative to later sends. Failures are logged, never
//! surfaced to the front-end.

use std::sync::Arc;

use bb7_protocol::ServerResponse;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::client::CompletionRequest;
use crate::client::CompletionTransport;
use crate::client::StreamEvent;
use crate::outgoing::OutgoingSender;
use crate::state::AppState;

const TITLE_SYSTEM_PROMPT: &str = "You name chat conversations. Reply with a short title \
for the exchange, at most six words, no quotes, no trailing punctuation.";

const MAX_TITLE_LEN: usize = 80;

pub fn spawn_title_job(
    state: Arc<Mutex<AppState>>,
    transport: Arc<dyn CompletionTransport>,
    outgoing: OutgoingSender,
    model: String,
    chat_id: Uuid,
    user_text: String,
    assistant_text: String,
) {
    tokio::spawn(async move {
        let request = CompletionRequest {
            model,
            system_prompt: TITLE_SYSTEM_PROMPT.to_string(),
            user_message: format!(
                "User:\n{user_text}\n\nAssistant:\n{assistant_text}\n\nReply with the title only."
            ),
            reasoning_effort: None,
            tools: Vec::new(),
            prompt_cache_key: None,
        };

        let mut events = transport.stream(request, CancellationToken::new());
        let mut raw = String::new();
        loop {
            match events.next().await {
                Some(StreamEvent::Content(delta)) => raw.push_str(&delta),
                Some(StreamEvent::Reasoning(_)) | Some(StreamEvent::ToolCall { .. }) => {}
                Some(StreamEvent::Done { .. }) | None => break,
                Some(StreamEvent::Error(e)) => {
                    warn!("title generation failed: {e}");
                    return;
                }
                Some(StreamEvent::Aborted) => return,
            }
        }

        let title = clean_title(&raw);
        if title.is_empty() {
            return;
        }

        {
            let mut state = state.lock().await;
            match state.chat_mut(chat_id) {
                Some(chat) => chat.title = Some(title.clone()),
                None => return,
            }
            if let Err(e) = state.persist(chat_id) {
                warn!("failed to persist generated title: {e}");
            }
        }

        outgoing
            .notify(ServerResponse::TitleUpdated { chat_id, title })
            .await;
    });
}

/// First line of the model's answer, stripped of surrounding quotes and
/// bounded in length.
fn clean_title(raw: &str) -> String {
    let first_line = raw.lines().next().unwrap_or_default();
    let trimmed = first_line
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim();
    let mut title: String = trimmed.chars().take(MAX_TITLE_LEN).collect();
    if trimmed.chars().count() > MAX_TITLE_LEN {
        title.push('…');
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn strips_quotes_and_keeps_first_line() {
        assert_eq!(clean_title("\"Fix the parser\"\nextra"), "Fix the parser");
        assert_eq!(clean_title("  `Rename module`  "), "Rename module");
    }

    #[test]
    fn long_titles_are_truncated() {
        let raw = "t".repeat(200);
        let title = clean_title(&raw);
        assert_eq!(title.chars().count(), MAX_TITLE_LEN + 1);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn empty_answer_yields_empty_title() {
        assert_eq!(clean_title("\n\n"), "");
    }
}
