//! Request dispatch: classify each incoming line, enforce the
//! no-mutation-during-stream policy, and route to a handler.
//!
//! Lock discipline: any action touching chat state runs under the process
//! state mutex for the duration of its handler. A `send` only reserves the
//! stream slot synchronously; the turn itself runs in a spawned task that
//! never holds the state mutex across the network round trip.

use std::sync::Arc;

use bb7_core::AppState;
use bb7_core::Config;
use bb7_core::StreamRegistry;
use bb7_core::TurnContext;
use bb7_core::config::effective_instructions;
use bb7_core::error::Bb7Err;
use bb7_core::file_fingerprint;
use bb7_core::outgoing::OutgoingSender;
use bb7_core::run_send_turn;
use bb7_core::state::estimate_tokens;
use bb7_core::turn::SendArgs;
use bb7_protocol::Action;
use bb7_protocol::Chat;
use bb7_protocol::ClientRequest;
use bb7_protocol::ContextAction;
use bb7_protocol::ContextEvent;
use bb7_protocol::ContextFile;
use bb7_protocol::Message;
use bb7_protocol::MessagePart;
use bb7_protocol::RequestId;
use bb7_protocol::Role;
use bb7_protocol::ServerResponse;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub(crate) enum Flow {
    Continue,
    Shutdown,
}

pub(crate) struct MessageProcessor {
    state: Arc<Mutex<AppState>>,
    registry: Arc<StreamRegistry>,
    transport: Arc<dyn bb7_core::CompletionTransport>,
    outgoing: OutgoingSender,
    config: Arc<Config>,
}

impl MessageProcessor {
    pub(crate) fn new(
        state: Arc<Mutex<AppState>>,
        registry: Arc<StreamRegistry>,
        transport: Arc<dyn bb7_core::CompletionTransport>,
        outgoing: OutgoingSender,
        config: Arc<Config>,
    ) -> Self {
        Self {
            state,
            registry,
            transport,
            outgoing,
            config,
        }
    }

    pub(crate) async fn process_line(&self, line: &str) -> Flow {
        let request: ClientRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("rejecting unparseable request: {e}");
                self.outgoing
                    .notify(ServerResponse::error(format!("invalid request: {e}")))
                    .await;
                return Flow::Continue;
            }
        };
        let request_id = request.request_id.clone();

        if self.registry.has_active() && request.action.blocked_during_stream() {
            self.outgoing
                .send(request_id, ServerResponse::error(Bb7Err::Busy.to_string()))
                .await;
            return Flow::Continue;
        }

        match request.action {
            Action::Shutdown => {
                self.outgoing.send(request_id, ServerResponse::ok()).await;
                Flow::Shutdown
            }
            // No-state actions answer without touching the state mutex.
            Action::Ping => {
                self.outgoing.send(request_id, ServerResponse::Pong).await;
                Flow::Continue
            }
            Action::Init => {
                self.outgoing
                    .send(
                        request_id,
                        ServerResponse::ok_with(json!({
                            "version": env!("CARGO_PKG_VERSION"),
                            "model": self.config.model,
                            "diff_mode": self.config.diff_mode.to_string(),
                        })),
                    )
                    .await;
                Flow::Continue
            }
            Action::Cancel { target_request_id } => {
                let response = if self.registry.cancel(target_request_id.as_ref()) {
                    ServerResponse::ok()
                } else {
                    ServerResponse::error("No active request to cancel")
                };
                self.outgoing.send(request_id, response).await;
                Flow::Continue
            }
            Action::Send {
                content,
                model,
                reasoning_effort,
                retry_context,
            } => {
                self.handle_send(request_id, content, model, reasoning_effort, retry_context)
                    .await;
                Flow::Continue
            }
            action => {
                let response = self.handle_state_action(action).await;
                self.outgoing.send(request_id, response).await;
                Flow::Continue
            }
        }
    }

    async fn handle_send(
        &self,
        request_id: Option<RequestId>,
        content: String,
        model: Option<String>,
        reasoning_effort: Option<bb7_protocol::ReasoningEffort>,
        retry_context: Option<bb7_protocol::RetryContext>,
    ) {
        let echo = request_id.is_some();
        let slot_id = request_id
            .clone()
            .unwrap_or_else(|| RequestId::String(Uuid::new_v4().to_string()));

        if !self.registry.reserve(&slot_id) {
            self.outgoing
                .send(request_id, ServerResponse::error(Bb7Err::Busy.to_string()))
                .await;
            return;
        }

        let ctx = TurnContext {
            state: self.state.clone(),
            registry: self.registry.clone(),
            transport: self.transport.clone(),
            outgoing: self.outgoing.clone(),
            config: self.config.clone(),
        };
        tokio::spawn(run_send_turn(
            ctx,
            SendArgs {
                request_id: slot_id,
                echo,
                content,
                model,
                reasoning_effort,
                retry_context,
            },
        ));
    }

    /// Handlers for everything that reads or writes chat state. Runs under
    /// the state mutex for its whole duration.
    async fn handle_state_action(&self, action: Action) -> ServerResponse {
        let mut state = self.state.lock().await;
        match action {
            Action::ChatActive => {
                ServerResponse::ok_with(json!({ "chat_id": state.active_chat_id() }))
            }
            Action::ChatList => {
                let mut chats: Vec<_> = state.chats().collect();
                chats.sort_by_key(|c| c.created_at);
                let listed: Vec<_> = chats
                    .iter()
                    .map(|c| {
                        json!({
                            "chat_id": c.id,
                            "title": c.title,
                            "model": c.model,
                            "created_at": c.created_at,
                        })
                    })
                    .collect();
                ServerResponse::ok_with(json!({ "chats": listed }))
            }
            Action::ChatGet { chat_id } => {
                let chat = match chat_id {
                    Some(id) => state.chat(id),
                    None => state.active_chat(),
                };
                match chat {
                    Some(chat) => match serde_json::to_value(chat) {
                        Ok(value) => ServerResponse::ok_with(json!({ "chat": value })),
                        Err(e) => ServerResponse::error(e.to_string()),
                    },
                    None => ServerResponse::error("no such chat"),
                }
            }
            Action::Estimate => match state.active_chat() {
                Some(chat) => ServerResponse::ok_with(json!({ "tokens": estimate_tokens(chat) })),
                None => ServerResponse::error(Bb7Err::NoActiveChat.to_string()),
            },
            Action::PrepareInstructions => ServerResponse::ok_with(json!({
                "instructions": effective_instructions(&self.config.bb7_home),
            })),
            Action::ChatNew { model } => {
                let model = model.unwrap_or_else(|| self.config.model.clone());
                match state.create_chat(model, self.config.reasoning_effort) {
                    Ok(id) => ServerResponse::ok_with(json!({ "chat_id": id })),
                    Err(e) => ServerResponse::error(e.to_string()),
                }
            }
            Action::ChatSelect { chat_id } => {
                if state.select_chat(chat_id) {
                    ServerResponse::ok()
                } else {
                    ServerResponse::error("no such chat")
                }
            }
            Action::ChatRename { chat_id, title } => {
                let Some(chat) = state.chat_mut(chat_id) else {
                    return ServerResponse::error("no such chat");
                };
                chat.title = Some(title);
                persist_or_error(&mut state, chat_id)
            }
            Action::ChatDelete { chat_id } => match state.delete_chat(chat_id) {
                Ok(true) => ServerResponse::ok(),
                Ok(false) => ServerResponse::error("no such chat"),
                Err(e) => ServerResponse::error(e.to_string()),
            },
            Action::SystemMessage { content } => {
                with_active_chat(&mut state, |chat| {
                    chat.messages.push(Message::flat(Role::System, content));
                    Ok(ServerResponse::ok())
                })
            }
            Action::DraftSave { content } => with_active_chat(&mut state, |chat| {
                chat.draft = content;
                Ok(ServerResponse::ok())
            }),
            Action::SettingsSave {
                model,
                reasoning_effort,
            } => with_active_chat(&mut state, |chat| {
                if let Some(model) = model {
                    chat.model = model;
                }
                if let Some(effort) = reasoning_effort {
                    chat.reasoning_effort = effort;
                }
                Ok(ServerResponse::ok())
            }),
            Action::ContextAdd {
                path,
                content,
                read_only,
                external,
            } => with_active_chat(&mut state, |chat| {
                if chat.whole_file(&path).is_some() {
                    return Err(format!("context already contains {path}"));
                }
                let fingerprint = file_fingerprint(&path, &content);
                chat.context_files.push(ContextFile {
                    path: path.clone(),
                    content,
                    read_only,
                    external,
                    start_line: None,
                    end_line: None,
                    fingerprint: fingerprint.clone(),
                });
                let mut event = ContextEvent::new(ContextAction::UserAddFile, path);
                event.version = Some(fingerprint);
                event.read_only = Some(read_only);
                event.external = Some(external);
                event.added = true;
                push_audit(chat, event);
                Ok(ServerResponse::ok())
            }),
            Action::ContextUpdate { path, content } => with_active_chat(&mut state, |chat| {
                let Some(file) = chat.whole_file_mut(&path) else {
                    return Err(format!("{path} is not in context"));
                };
                let prev_version = file.fingerprint.clone();
                file.content = content;
                file.fingerprint = file_fingerprint(&file.path, &file.content);
                let version = file.fingerprint.clone();
                let mut event = ContextEvent::new(ContextAction::UserUpdateFile, path);
                event.version = Some(version);
                event.prev_version = Some(prev_version);
                push_audit(chat, event);
                Ok(ServerResponse::ok())
            }),
            Action::ContextRemove { path } => with_active_chat(&mut state, |chat| {
                let Some(index) = chat
                    .context_files
                    .iter()
                    .position(|f| f.path == path && !f.is_section())
                else {
                    return Err(format!("{path} is not in context"));
                };
                let removed = chat.context_files.remove(index);
                let mut event = ContextEvent::new(ContextAction::UserRemoveFile, path);
                event.prev_version = Some(removed.fingerprint);
                push_audit(chat, event);
                Ok(ServerResponse::ok())
            }),
            Action::ContextAddSection {
                path,
                content,
                start_line,
                end_line,
            } => with_active_chat(&mut state, |chat| {
                if start_line < 1 || end_line < start_line {
                    return Err(format!("invalid section range {start_line}-{end_line}"));
                }
                let overlaps = chat.sections_for(&path).any(|existing| {
                    let (Some(start), Some(end)) = (existing.start_line, existing.end_line) else {
                        return false;
                    };
                    start_line <= end && start <= end_line
                });
                if overlaps {
                    return Err(format!(
                        "section {start_line}-{end_line} overlaps an existing section of {path}"
                    ));
                }
                let fingerprint = file_fingerprint(&path, &content);
                chat.context_files.push(ContextFile {
                    path: path.clone(),
                    content,
                    // Section snippets are always readonly and immutable.
                    read_only: true,
                    external: false,
                    start_line: Some(start_line),
                    end_line: Some(end_line),
                    fingerprint: fingerprint.clone(),
                });
                let mut event = ContextEvent::new(ContextAction::UserAddSection, path);
                event.version = Some(fingerprint);
                event.read_only = Some(true);
                event.start_line = Some(start_line);
                event.end_line = Some(end_line);
                event.added = true;
                push_audit(chat, event);
                Ok(ServerResponse::ok())
            }),
            Action::ContextRemoveSection {
                path,
                start_line,
                end_line,
            } => with_active_chat(&mut state, |chat| {
                let Some(index) = chat.context_files.iter().position(|f| {
                    f.path == path
                        && f.start_line == Some(start_line)
                        && f.end_line == Some(end_line)
                }) else {
                    return Err(format!("no section {start_line}-{end_line} for {path}"));
                };
                let removed = chat.context_files.remove(index);
                let mut event = ContextEvent::new(ContextAction::UserRemoveSection, path);
                event.prev_version = Some(removed.fingerprint);
                event.start_line = Some(start_line);
                event.end_line = Some(end_line);
                push_audit(chat, event);
                Ok(ServerResponse::ok())
            }),
            Action::ContextSetReadOnly { path, read_only } => {
                with_active_chat(&mut state, |chat| {
                    let Some(file) = chat.whole_file_mut(&path) else {
                        return Err(format!("{path} is not in context"));
                    };
                    file.read_only = read_only;
                    let version = file.fingerprint.clone();
                    let mut event = ContextEvent::new(ContextAction::UserSetReadOnly, path);
                    event.version = Some(version);
                    event.read_only = Some(read_only);
                    push_audit(chat, event);
                    Ok(ServerResponse::ok())
                })
            }
            Action::OutputApply { path, disk_content } => {
                with_active_chat(&mut state, |chat| {
                    let Some(output) = chat.outputs.remove(&path) else {
                        return Err(format!("no pending output for {path}"));
                    };

                    // The front-end owns the working tree; it tells us what
                    // is on disk. Disagreement with the stored snapshot means
                    // the file diverged since it was attached.
                    if let Some(snapshot) = chat.whole_file(&path) {
                        let snapshot_version = snapshot.fingerprint.clone();
                        match &disk_content {
                            None => {
                                let mut event =
                                    ContextEvent::new(ContextAction::ForkWarningDeleted, &path);
                                event.prev_version = Some(snapshot_version);
                                push_audit(chat, event);
                            }
                            Some(disk) if *disk != snapshot.content => {
                                let mut event =
                                    ContextEvent::new(ContextAction::ForkWarningModified, &path);
                                event.prev_version = Some(snapshot_version);
                                push_audit(chat, event);
                            }
                            Some(_) => {}
                        }
                    }

                    let version = file_fingerprint(&path, &output);
                    let prev_version = match chat.whole_file_mut(&path) {
                        Some(file) => {
                            let prev = file.fingerprint.clone();
                            file.content = output;
                            file.fingerprint = version.clone();
                            Some(prev)
                        }
                        None => None,
                    };
                    let mut event = ContextEvent::new(ContextAction::UserApplyFile, path);
                    event.version = Some(version);
                    event.prev_version = prev_version;
                    push_audit(chat, event);
                    Ok(ServerResponse::ok())
                })
            }
            Action::OutputSaveAs { path, new_path } => with_active_chat(&mut state, |chat| {
                let Some(output) = chat.outputs.remove(&path) else {
                    return Err(format!("no pending output for {path}"));
                };
                let mut event = ContextEvent::new(ContextAction::UserSaveAs, new_path.clone());
                event.version = Some(file_fingerprint(&new_path, &output));
                event.original_path = Some(path);
                push_audit(chat, event);
                Ok(ServerResponse::ok())
            }),
            Action::OutputReject { path } => with_active_chat(&mut state, |chat| {
                let Some(output) = chat.outputs.remove(&path) else {
                    return Err(format!("no pending output for {path}"));
                };
                let mut event = ContextEvent::new(ContextAction::UserRejectOutput, &path);
                event.prev_version = Some(file_fingerprint(&path, &output));
                push_audit(chat, event);
                Ok(ServerResponse::ok())
            }),
            Action::Init
            | Action::Ping
            | Action::Send { .. }
            | Action::Cancel { .. }
            | Action::Shutdown => {
                // Routed before this handler is reached.
                ServerResponse::error("unsupported action")
            }
        }
    }
}

fn push_audit(chat: &mut Chat, event: ContextEvent) {
    chat.messages.push(Message::with_parts(
        Role::User,
        vec![MessagePart::ContextEvent(event)],
    ));
}

fn persist_or_error(state: &mut AppState, chat_id: Uuid) -> ServerResponse {
    match state.persist(chat_id) {
        Ok(()) => ServerResponse::ok(),
        Err(e) => ServerResponse::error(e.to_string()),
    }
}

/// Run `f` against the active chat, then persist. `f` returns `Err` with a
/// user-facing message to reject the action without persisting.
fn with_active_chat(
    state: &mut AppState,
    f: impl FnOnce(&mut Chat) -> Result<ServerResponse, String>,
) -> ServerResponse {
    let Some(chat) = state.active_chat_mut() else {
        return ServerResponse::error(Bb7Err::NoActiveChat.to_string());
    };
    let chat_id = chat.id;
    match f(chat) {
        Ok(response) => match state.persist(chat_id) {
            Ok(()) => response,
            Err(e) => ServerResponse::error(e.to_string()),
        },
        Err(message) => ServerResponse::error(message),
    }
}
