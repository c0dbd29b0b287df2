//! The turn engine: one user send, from reservation to the final response.
//!
//! A turn streams completion events and buffers assistant file edits in a
//! turn-local pending map. Nothing touches the chat's output store until the
//! stream has terminated and the termination is classified: a clean
//! completion commits, collected diff failures turn into a `diff_error`
//! without committing, terminal stream errors discard everything, and a user
//! cancel preserves whatever partial output arrived.
//!
//! Lock discipline: the state mutex is held during setup (prompt assembly +
//! user-message append) and during the final classification/commit, never
//! across the network stream.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use bb7_protocol::ContextAction;
use bb7_protocol::ContextEvent;
use bb7_protocol::Message;
use bb7_protocol::MessagePart;
use bb7_protocol::ReasoningEffort;
use bb7_protocol::RequestId;
use bb7_protocol::RetryContext;
use bb7_protocol::Role;
use bb7_protocol::ServerResponse;
use bb7_protocol::ToolCallRecord;
use bb7_protocol::Usage;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::client::CompletionRequest;
use crate::client::CompletionTransport;
use crate::client::StreamEvent;
use crate::config::Config;
use crate::config::effective_instructions;
use crate::error::Bb7Err;
use crate::fingerprint::file_fingerprint;
use crate::outgoing::OutgoingSender;
use crate::prompt::assemble_prompt;
use crate::registry::StreamRegistry;
use crate::state::AppState;
use crate::title::spawn_title_job;
use crate::tools;
use crate::tools::ParsedToolCall;
use crate::tools::ToolParseError;

pub const ABORT_MESSAGE: &str = "Response aborted by user.";

/// Everything a turn task needs; cloned handles, no borrowed state.
#[derive(Clone)]
pub struct TurnContext {
    pub state: Arc<Mutex<AppState>>,
    pub registry: Arc<StreamRegistry>,
    pub transport: Arc<dyn CompletionTransport>,
    pub outgoing: OutgoingSender,
    pub config: Arc<Config>,
}

pub struct SendArgs {
    /// Key for the stream slot. When the client sent no `request_id` the
    /// dispatcher synthesizes one; `echo` is false then so responses do not
    /// carry an id the client never chose.
    pub request_id: RequestId,
    pub echo: bool,
    pub content: String,
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub retry_context: Option<RetryContext>,
}

/// Snapshot taken under the state lock before streaming begins. The stream
/// loop resolves edit bases against these copies instead of re-locking.
struct TurnSetup {
    chat_id: Uuid,
    model: String,
    effort: ReasoningEffort,
    prompt: String,
    prior_context: HashSet<String>,
    outputs_snapshot: HashMap<String, String>,
    context_snapshot: HashMap<String, String>,
    first_exchange: bool,
}

#[derive(Default)]
struct TurnAccum {
    text: String,
    thinking: String,
    pending_writes: HashMap<String, String>,
    /// Paths in first-write order, de-duplicated.
    output_files: Vec<String>,
    diff_errors: Vec<String>,
    tool_log: Vec<ToolCallRecord>,
    seen_paths: HashSet<String>,
    usage: Option<Usage>,
}

impl TurnAccum {
    fn record_write(&mut self, path: &str, content: String) {
        self.pending_writes.insert(path.to_string(), content);
        if !self.output_files.iter().any(|p| p == path) {
            self.output_files.push(path.to_string());
        }
    }

    /// Base content for an edit: the turn's own pending write wins, then the
    /// chat's pending output, then the context snapshot.
    fn resolve_base(&self, setup: &TurnSetup, path: &str) -> Option<String> {
        self.pending_writes
            .get(path)
            .or_else(|| setup.outputs_snapshot.get(path))
            .or_else(|| setup.context_snapshot.get(path))
            .cloned()
    }
}

enum Ending {
    Completed,
    Terminal(String),
    Canceled,
}

/// Entry point for a reserved send. The caller has already claimed the
/// stream slot for `args.request_id`; the slot is released on every return
/// path.
pub async fn run_send_turn(ctx: TurnContext, args: SendArgs) {
    let request_id = args.request_id.clone();
    run_reserved_turn(&ctx, args).await;
    ctx.registry.clear(&request_id);
}

async fn run_reserved_turn(ctx: &TurnContext, args: SendArgs) {
    let request_id = args.request_id.clone();
    let echo_id: Option<RequestId> = args.echo.then(|| request_id.clone());

    // A cancel can land between reservation and this task starting.
    if ctx.registry.was_canceled(&request_id) {
        ctx.outgoing
            .send(echo_id, ServerResponse::error(ABORT_MESSAGE))
            .await;
        return;
    }

    let started = Instant::now();

    let setup = {
        let mut state = ctx.state.lock().await;
        let Some(chat) = state.active_chat_mut() else {
            ctx.outgoing
                .send(
                    echo_id,
                    ServerResponse::error(Bb7Err::NoActiveChat.to_string()),
                )
                .await;
            return;
        };

        let model = args.model.clone().unwrap_or_else(|| chat.model.clone());
        let effort = args.reasoning_effort.unwrap_or(chat.reasoning_effort);
        let first_exchange = !chat.messages.iter().any(|m| m.role == Role::Assistant);

        chat.messages
            .push(Message::flat(Role::User, args.content.clone()));
        let assembled = assemble_prompt(chat, args.retry_context.as_ref());

        let chat_id = chat.id;
        let prior_context: HashSet<String> = chat
            .context_files
            .iter()
            .filter(|f| !f.is_section())
            .map(|f| f.path.clone())
            .collect();
        let context_snapshot: HashMap<String, String> = chat
            .context_files
            .iter()
            .filter(|f| !f.is_section())
            .map(|f| (f.path.clone(), f.content.clone()))
            .collect();
        let outputs_snapshot = chat.outputs.clone().into_iter().collect();

        // The appended user message (and any refreshed fingerprints) must be
        // durable before anything streams.
        if let Err(e) = state.persist(chat_id) {
            ctx.outgoing
                .send(echo_id, ServerResponse::error(e.to_string()))
                .await;
            return;
        }

        TurnSetup {
            chat_id,
            model,
            effort,
            prompt: assembled.text,
            prior_context,
            outputs_snapshot,
            context_snapshot,
            first_exchange,
        }
    };

    let request = CompletionRequest {
        model: setup.model.clone(),
        system_prompt: effective_instructions(&ctx.config.bb7_home),
        user_message: setup.prompt.clone(),
        tools: tools::create_tools_json(ctx.config.diff_mode),
        reasoning_effort: Some(setup.effort),
        prompt_cache_key: Some(format!("bb7:{}:{}", setup.chat_id, setup.model)),
    };

    let cancel = CancellationToken::new();
    if !ctx.registry.set_cancel(&request_id, cancel.clone()) || ctx.registry.was_canceled(&request_id)
    {
        // Canceled during setup; the derived token short-circuits the stream.
        cancel.cancel();
    }

    let mut events = ctx.transport.stream(request, cancel.clone());
    let mut acc = TurnAccum::default();

    let ending = loop {
        let Some(event) = events.next().await else {
            break Ending::Terminal("stream closed unexpectedly".to_string());
        };
        match event {
            StreamEvent::Content(delta) => {
                acc.text.push_str(&delta);
                ctx.outgoing
                    .send(echo_id.clone(), ServerResponse::Chunk { content: delta })
                    .await;
            }
            StreamEvent::Reasoning(delta) => {
                acc.thinking.push_str(&delta);
                ctx.outgoing
                    .send(echo_id.clone(), ServerResponse::Thinking { content: delta })
                    .await;
            }
            StreamEvent::ToolCall {
                name, arguments, ..
            } => {
                if let Err(terminal) =
                    handle_tool_call(ctx, &echo_id, &setup, &mut acc, &name, &arguments).await
                {
                    cancel.cancel();
                    break Ending::Terminal(terminal);
                }
            }
            StreamEvent::Done { usage } => {
                if usage.is_some() {
                    acc.usage = usage;
                }
                break Ending::Completed;
            }
            StreamEvent::Error(message) => break Ending::Terminal(message),
            StreamEvent::Aborted => break Ending::Canceled,
        }
    };

    let duration = started.elapsed().as_secs_f64();
    conclude_turn(ctx, echo_id, setup, acc, ending, duration, &args.content).await;
}

/// Returns `Err` with the terminal error message when the tool call must
/// abort the whole stream; diff failures are collected instead.
async fn handle_tool_call(
    ctx: &TurnContext,
    echo_id: &Option<RequestId>,
    setup: &TurnSetup,
    acc: &mut TurnAccum,
    name: &str,
    arguments: &str,
) -> Result<(), String> {
    let args_value = serde_json::from_str::<serde_json::Value>(arguments)
        .unwrap_or_else(|_| serde_json::Value::String(arguments.to_string()));
    let log_path = args_value
        .get("path")
        .and_then(|p| p.as_str())
        .map(str::to_string)
        .or_else(|| {
            args_value
                .get("edits")
                .and_then(|e| e.get(0))
                .and_then(|e| e.get("path"))
                .and_then(|p| p.as_str())
                .map(str::to_string)
        })
        .unwrap_or_default();
    acc.tool_log.push(ToolCallRecord {
        tool: name.to_string(),
        path: log_path,
        args: args_value,
    });

    match tools::parse_tool_call(ctx.config.diff_mode, name, arguments) {
        Ok(ParsedToolCall::WriteFile(write)) => {
            if !acc.seen_paths.insert(write.path.clone()) {
                return Err(format!(
                    "Duplicate write_file for path in single response: {}",
                    write.path
                ));
            }
            let known = setup.prior_context.contains(&write.path)
                || setup.outputs_snapshot.contains_key(&write.path)
                || acc.pending_writes.contains_key(&write.path);
            let verb = if known { "modified" } else { "added" };
            let status = format!("Assistant {verb}: {}", write.path);
            acc.record_write(&write.path, write.content);
            ctx.outgoing
                .send(echo_id.clone(), ServerResponse::Chunk { content: status })
                .await;
            Ok(())
        }
        Ok(ParsedToolCall::SearchReplace(edit)) => {
            let Some(base) = acc.resolve_base(setup, &edit.path) else {
                acc.diff_errors
                    .push(format!("{}: no base file found for edit", edit.path));
                return Ok(());
            };
            let base_fingerprint = file_fingerprint(&edit.path, &base);
            if let Some(supplied) = &edit.file_id
                && *supplied != base_fingerprint
            {
                acc.diff_errors.push(format!(
                    "{}: file_id mismatch: expected {base_fingerprint}, got {supplied}",
                    edit.path
                ));
                return Ok(());
            }
            match bb7_patch::apply_search_replace(&base, &edit.old, &edit.new, edit.replace_all) {
                Ok(outcome) => {
                    if outcome.no_op {
                        debug!("no-op edit for {}: old equals new", edit.path);
                    } else {
                        acc.record_write(&edit.path, outcome.content);
                    }
                }
                Err(e) => acc.diff_errors.push(format!("{}: {e}", edit.path)),
            }
            Ok(())
        }
        Ok(ParsedToolCall::SearchReplaceMulti(batch)) => {
            // All-or-nothing per tool call: edits apply to a scratch copy
            // that is only folded into the pending writes if every edit
            // lands.
            let mut scratch: HashMap<String, String> = HashMap::new();
            let mut touched_order: Vec<String> = Vec::new();
            let mut validated: HashSet<String> = HashSet::new();
            let mut failure: Option<String> = None;

            for (index, edit) in batch.edits.iter().enumerate() {
                let base = match scratch.get(&edit.path) {
                    Some(content) => content.clone(),
                    None => match acc.resolve_base(setup, &edit.path) {
                        Some(content) => content,
                        None => {
                            failure = Some(format!(
                                "edit {index} ({}): no base file found for edit",
                                edit.path
                            ));
                            break;
                        }
                    },
                };

                // fileId is validated once per path per tool call, against
                // the base as it stood when the call began.
                if validated.insert(edit.path.clone())
                    && let Some(supplied) = &edit.file_id
                {
                    let base_fingerprint = file_fingerprint(&edit.path, &base);
                    if *supplied != base_fingerprint {
                        failure = Some(format!(
                            "edit {index} ({}): file_id mismatch: expected {base_fingerprint}, got {supplied}",
                            edit.path
                        ));
                        break;
                    }
                }

                match bb7_patch::apply_search_replace(&base, &edit.old, &edit.new, edit.replace_all)
                {
                    Ok(outcome) => {
                        if !touched_order.iter().any(|p| p == &edit.path) {
                            touched_order.push(edit.path.clone());
                        }
                        scratch.insert(edit.path.clone(), outcome.content);
                    }
                    Err(e) => {
                        failure = Some(format!("edit {index} ({}): {e}", edit.path));
                        break;
                    }
                }
            }

            match failure {
                Some(message) => acc.diff_errors.push(message),
                None => {
                    for path in touched_order {
                        if let Some(content) = scratch.remove(&path) {
                            acc.record_write(&path, content);
                        }
                    }
                }
            }
            Ok(())
        }
        Ok(ParsedToolCall::Anchored(edit)) => {
            if !acc.seen_paths.insert(edit.path.clone()) {
                return Err(format!(
                    "Duplicate edit_file for path in single response: {}",
                    edit.path
                ));
            }
            let Some(base) = acc.resolve_base(setup, &edit.path) else {
                acc.diff_errors
                    .push(format!("{}: no base file found for edit", edit.path));
                return Ok(());
            };
            let base_fingerprint = file_fingerprint(&edit.path, &base);
            if let Some(supplied) = &edit.file_id
                && *supplied != base_fingerprint
            {
                acc.diff_errors.push(format!(
                    "{}: file_id mismatch: expected {base_fingerprint}, got {supplied}",
                    edit.path
                ));
                return Ok(());
            }
            let changes: Vec<bb7_patch::AnchoredChange> = edit
                .changes
                .iter()
                .map(|c| bb7_patch::AnchoredChange {
                    start: c.start,
                    end: c.end,
                    content: c.content.clone(),
                })
                .collect();
            match bb7_patch::apply_anchored(&base, &changes) {
                Ok(outcome) => {
                    if !outcome.dropped_no_ops.is_empty() {
                        debug!(
                            "dropped {} verbatim no-op changes for {}",
                            outcome.dropped_no_ops.len(),
                            edit.path
                        );
                    }
                    if outcome.content != base {
                        acc.record_write(&edit.path, outcome.content);
                    }
                }
                Err(e) => acc.diff_errors.push(format!("{}: {e}", edit.path)),
            }
            Ok(())
        }
        Err(ToolParseError::FileIdMissing { index, path }) => {
            acc.diff_errors
                .push(format!("edit {index} ({path}): file_id missing"));
            Ok(())
        }
        Err(err @ ToolParseError::Malformed { tool: "edit_file", .. }) => Err(err.to_string()),
        Err(err) => {
            // Malformed write_file arguments or an undeclared tool: recorded
            // in the log already, skipped, not terminal.
            warn!("skipping tool call {name}: {err}");
            Ok(())
        }
    }
}

/// Build the `AssistantWriteFile` part for each buffered path and fold the
/// pending writes into the chat's output store.
fn commit_writes(
    chat: &mut bb7_protocol::Chat,
    setup: &TurnSetup,
    acc: &TurnAccum,
) -> Vec<MessagePart> {
    let mut parts = Vec::new();
    for path in &acc.output_files {
        let Some(content) = acc.pending_writes.get(path) else {
            continue;
        };
        chat.outputs.insert(path.clone(), content.clone());
        let mut event = ContextEvent::new(ContextAction::AssistantWriteFile, path.clone());
        event.version = Some(file_fingerprint(path, content));
        event.added = !setup.prior_context.contains(path);
        parts.push(MessagePart::ContextEvent(event));
    }
    parts
}

#[allow(clippy::too_many_arguments)]
async fn conclude_turn(
    ctx: &TurnContext,
    echo_id: Option<RequestId>,
    setup: TurnSetup,
    acc: TurnAccum,
    ending: Ending,
    duration: f64,
    user_content: &str,
) {
    match ending {
        Ending::Terminal(message) => {
            let mut state = ctx.state.lock().await;
            if let Some(chat) = state.chat_mut(setup.chat_id) {
                chat.messages
                    .push(Message::flat(Role::System, message.clone()));
                if let Err(e) = state.persist(setup.chat_id) {
                    warn!("failed to persist chat after stream error: {e}");
                }
            }
            drop(state);
            ctx.outgoing
                .send(echo_id, ServerResponse::Error { message })
                .await;
        }
        Ending::Canceled => {
            let has_partial =
                !acc.text.is_empty() || !acc.thinking.is_empty() || !acc.pending_writes.is_empty();
            let mut state = ctx.state.lock().await;
            if let Some(chat) = state.chat_mut(setup.chat_id) {
                if has_partial {
                    let mut parts = Vec::new();
                    if !acc.thinking.is_empty() {
                        parts.push(MessagePart::Thinking {
                            content: acc.thinking.clone(),
                        });
                    }
                    if !acc.text.is_empty() {
                        parts.push(MessagePart::Text {
                            content: acc.text.clone(),
                        });
                    }
                    // Partial writes survive a cancel only when no diff
                    // failure was collected.
                    if acc.diff_errors.is_empty() {
                        parts.extend(commit_writes(chat, &setup, &acc));
                    }
                    let mut message = Message::with_parts(Role::Assistant, parts);
                    message.usage = acc.usage.clone();
                    message.model = Some(setup.model.clone());
                    message.reasoning_effort = Some(setup.effort);
                    chat.messages.push(message);
                }
                chat.messages
                    .push(Message::flat(Role::System, ABORT_MESSAGE));
                if let Err(e) = state.persist(setup.chat_id) {
                    warn!("failed to persist chat after cancel: {e}");
                }
            }
            drop(state);
            ctx.outgoing
                .send(echo_id, ServerResponse::error(ABORT_MESSAGE))
                .await;
        }
        Ending::Completed if !acc.diff_errors.is_empty() => {
            let mut state = ctx.state.lock().await;
            if let Some(chat) = state.chat_mut(setup.chat_id) {
                let mut parts = Vec::new();
                if !acc.thinking.is_empty() {
                    parts.push(MessagePart::Thinking {
                        content: acc.thinking.clone(),
                    });
                }
                if !acc.text.is_empty() {
                    parts.push(MessagePart::Text {
                        content: acc.text.clone(),
                    });
                }
                if !parts.is_empty() {
                    let mut message = Message::with_parts(Role::Assistant, parts);
                    message.usage = acc.usage.clone();
                    message.model = Some(setup.model.clone());
                    message.reasoning_effort = Some(setup.effort);
                    chat.messages.push(message);
                }
                if let Err(e) = state.persist(setup.chat_id) {
                    warn!("failed to persist chat after diff errors: {e}");
                }
            }
            drop(state);
            ctx.outgoing
                .send(
                    echo_id,
                    ServerResponse::DiffError {
                        errors: acc.diff_errors,
                        tool_calls: acc.tool_log,
                        usage: acc.usage,
                        duration,
                    },
                )
                .await;
        }
        Ending::Completed => {
            let mut state = ctx.state.lock().await;
            let Some(chat) = state.chat_mut(setup.chat_id) else {
                drop(state);
                ctx.outgoing
                    .send(
                        echo_id,
                        ServerResponse::error(Bb7Err::NoActiveChat.to_string()),
                    )
                    .await;
                return;
            };

            let mut parts = Vec::new();
            if !acc.thinking.is_empty() {
                parts.push(MessagePart::Thinking {
                    content: acc.thinking.clone(),
                });
            }
            if !acc.text.is_empty() {
                parts.push(MessagePart::Text {
                    content: acc.text.clone(),
                });
            }
            parts.extend(commit_writes(chat, &setup, &acc));

            let mut message = Message::with_parts(Role::Assistant, parts);
            message.usage = acc.usage.clone();
            message.model = Some(setup.model.clone());
            message.reasoning_effort = Some(setup.effort);
            chat.messages.push(message);

            let spawn_title = setup.first_exchange && chat.title.is_none();
            let assistant_text = acc.text.clone();

            if let Err(e) = state.persist(setup.chat_id) {
                drop(state);
                ctx.outgoing
                    .send(echo_id, ServerResponse::error(e.to_string()))
                    .await;
                return;
            }
            drop(state);

            if spawn_title {
                spawn_title_job(
                    ctx.state.clone(),
                    ctx.transport.clone(),
                    ctx.outgoing.clone(),
                    setup.model.clone(),
                    setup.chat_id,
                    user_content.to_string(),
                    assistant_text,
                );
            }

            ctx.outgoing
                .send(
                    echo_id,
                    ServerResponse::Done {
                        output_files: acc.output_files,
                        usage: acc.usage,
                        duration,
                    },
                )
                .await;
        }
    }
}
