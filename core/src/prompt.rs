//! Assembles the single structured user message sent to the completion
//! service.
//!
//! The document has a fixed section order — readonly files, history, latest,
//! retry context, writable files — and any empty section is omitted. Files
//! render as `@file` blocks whose `id` attribute is the fingerprint the
//! model must echo back as `fileId` when editing.

use bb7_protocol::Chat;
use bb7_protocol::ContextEvent;
use bb7_protocol::Message;
use bb7_protocol::MessagePart;
use bb7_protocol::RetryContext;
use bb7_protocol::Role;

use crate::fingerprint::file_fingerprint;

const SECTION_RULE: &str = "────────────";

pub struct AssembledPrompt {
    pub text: String,
    /// A stored fingerprint was stale and got refreshed; the caller must
    /// persist the chat before using the prompt.
    pub refreshed: bool,
}

#[derive(Debug, Clone)]
struct FileEntry {
    fingerprint: String,
    path: String,
    writable: bool,
    source: &'static str,
    lines: Option<(usize, usize)>,
    status: Option<&'static str>,
    content: String,
}

fn section_header(title: &str) -> String {
    format!("{SECTION_RULE} {title} {SECTION_RULE}\n")
}

fn push_terminated(out: &mut String, content: &str) {
    out.push_str(content);
    if !content.is_empty() && !content.ends_with('\n') {
        out.push('\n');
    }
}

fn render_file_block(out: &mut String, entry: &FileEntry) {
    out.push_str(&format!(
        "@file id={} path={} mode={} source={}",
        entry.fingerprint,
        entry.path,
        if entry.writable { "rw" } else { "ro" },
        entry.source,
    ));
    if let Some((start, end)) = entry.lines {
        out.push_str(&format!(" lines={start}-{end}"));
    }
    if let Some(status) = entry.status {
        out.push_str(&format!(" status={status}"));
    }
    out.push('\n');
    push_terminated(out, &entry.content);
    out.push_str(&format!("@end file id={}\n", entry.fingerprint));
}

fn render_file_summary(out: &mut String, entry: &FileEntry) {
    out.push_str(&format!(
        "  id={} path={} mode={}",
        entry.fingerprint,
        entry.path,
        if entry.writable { "rw" } else { "ro" },
    ));
    if let Some((start, end)) = entry.lines {
        out.push_str(&format!(" lines={start}-{end}"));
    }
    if let Some(status) = entry.status {
        out.push_str(&format!(" status={status}"));
    }
    out.push('\n');
}

fn render_msg_block(out: &mut String, id: usize, role: Role, kind: Option<&str>, content: &str) {
    out.push_str(&format!("@msg id={id} role={role}"));
    if let Some(kind) = kind {
        out.push_str(&format!(" kind={kind}"));
    }
    out.push('\n');
    push_terminated(out, content);
    out.push_str(&format!("@end msg id={id}\n"));
}

fn render_action_block(out: &mut String, id: usize, event: &ContextEvent) {
    out.push_str(&format!("@action id={id} type={}", event.action));
    if let Some(version) = &event.version {
        out.push_str(&format!(" file_id={version}"));
    }
    out.push_str(&format!(" path={}", event.path));
    if let (Some(start), Some(end)) = (event.start_line, event.end_line) {
        out.push_str(&format!(" lines={start}-{end}"));
    }
    if let Some(prev) = &event.prev_version {
        out.push_str(&format!(" prev_file_id={prev}"));
    }
    if let Some(read_only) = event.read_only {
        out.push_str(&format!(" readonly={read_only}"));
    }
    if let Some(external) = event.external {
        out.push_str(&format!(" external={external}"));
    }
    if event.added {
        out.push_str(" added=true");
    }
    out.push('\n');
    out.push_str(&format!("@end action id={id}\n"));
}

/// Classify the chat's files into readonly and writable prompt entries,
/// both sorted by (path, fingerprint).
fn classify_files(chat: &Chat) -> (Vec<FileEntry>, Vec<FileEntry>) {
    let mut readonly = Vec::new();
    let mut writable = Vec::new();

    for file in &chat.context_files {
        if file.is_section() {
            readonly.push(FileEntry {
                fingerprint: file.fingerprint.clone(),
                path: file.path.clone(),
                writable: false,
                source: "context",
                lines: file.start_line.zip(file.end_line),
                status: None,
                content: file.content.clone(),
            });
            continue;
        }

        let pending_output = chat.outputs.get(&file.path);
        if file.read_only || file.external {
            readonly.push(FileEntry {
                fingerprint: file.fingerprint.clone(),
                path: file.path.clone(),
                writable: false,
                source: "context",
                lines: None,
                status: None,
                content: file.content.clone(),
            });
        } else if let Some(output) = pending_output {
            // Two entries: the original snapshot stays readonly while the
            // pending output is the writable copy the model edits.
            readonly.push(FileEntry {
                fingerprint: file.fingerprint.clone(),
                path: file.path.clone(),
                writable: false,
                source: "context",
                lines: None,
                status: Some("original"),
                content: file.content.clone(),
            });
            writable.push(FileEntry {
                fingerprint: file_fingerprint(&file.path, output),
                path: file.path.clone(),
                writable: true,
                source: "output",
                lines: None,
                status: Some("pending_output"),
                content: output.clone(),
            });
        } else {
            writable.push(FileEntry {
                fingerprint: file.fingerprint.clone(),
                path: file.path.clone(),
                writable: true,
                source: "context",
                lines: None,
                status: None,
                content: file.content.clone(),
            });
        }
    }

    for (path, output) in &chat.outputs {
        if chat.whole_file(path).is_none() {
            writable.push(FileEntry {
                fingerprint: file_fingerprint(path, output),
                path: path.clone(),
                writable: true,
                source: "output",
                lines: None,
                status: Some("added_output"),
                content: output.clone(),
            });
        }
    }

    let by_path_then_id =
        |a: &FileEntry, b: &FileEntry| (&a.path, &a.fingerprint).cmp(&(&b.path, &b.fingerprint));
    readonly.sort_by(by_path_then_id);
    writable.sort_by(by_path_then_id);
    (readonly, writable)
}

fn render_history(out: &mut String, messages: &[Message], next_id: &mut usize) {
    for message in messages {
        match &message.parts {
            Some(parts) => {
                for part in parts {
                    let id = *next_id;
                    *next_id += 1;
                    match part {
                        MessagePart::Text { content } => {
                            render_msg_block(out, id, message.role, None, content);
                        }
                        MessagePart::Thinking { content } => {
                            render_msg_block(out, id, message.role, Some("reasoning"), content);
                        }
                        MessagePart::Code { content, .. } => {
                            render_msg_block(out, id, message.role, Some("code"), content);
                        }
                        MessagePart::Raw { content } => {
                            render_msg_block(out, id, message.role, Some("raw"), content);
                        }
                        MessagePart::ContextEvent(event) => {
                            render_action_block(out, id, event);
                        }
                    }
                }
            }
            None => {
                if message.role == Role::System {
                    // Audit entries for the front-end, not model context.
                    continue;
                }
                let id = *next_id;
                *next_id += 1;
                render_msg_block(out, id, message.role, None, &message.content.clone().unwrap_or_default());
            }
        }
    }
}

fn render_retry_context(out: &mut String, retry: &RetryContext) {
    out.push_str("@retry_context\n");
    out.push_str("The previous response could not be applied.\n\nErrors:\n");
    for error in &retry.errors {
        out.push_str(&format!("- {error}\n"));
    }
    out.push_str("\nPrevious tool calls:\n");
    let calls = serde_json::to_string_pretty(&retry.tool_calls).unwrap_or_else(|_| "[]".to_string());
    push_terminated(out, &calls);
    out.push_str("@end retry_context\n");
}

/// Build the prompt document for `chat`. The last user message becomes the
/// `@latest` block; everything before it renders as history.
pub fn assemble_prompt(chat: &mut Chat, retry: Option<&RetryContext>) -> AssembledPrompt {
    let mut refreshed = false;
    for file in &mut chat.context_files {
        let fingerprint = file_fingerprint(&file.path, &file.content);
        if fingerprint != file.fingerprint {
            file.fingerprint = fingerprint;
            refreshed = true;
        }
    }

    let (readonly, writable) = classify_files(chat);

    let latest_index = chat
        .messages
        .iter()
        .rposition(|m| m.role == Role::User);

    let mut text = String::new();

    if !readonly.is_empty() {
        text.push_str(&section_header("readonly files"));
        for entry in &readonly {
            render_file_block(&mut text, entry);
        }
    }

    let mut next_id = 1usize;
    if let Some(latest_index) = latest_index {
        let history = &chat.messages[..latest_index];
        if !history.is_empty() {
            let mut rendered = String::new();
            render_history(&mut rendered, history, &mut next_id);
            if !rendered.is_empty() {
                text.push_str(&section_header("history"));
                text.push_str(&rendered);
            }
        }

        text.push_str(&section_header("latest"));
        text.push_str("@latest\n");
        if !readonly.is_empty() || !writable.is_empty() {
            text.push_str("Files:\n");
            for entry in readonly.iter().chain(writable.iter()) {
                render_file_summary(&mut text, entry);
            }
            text.push('\n');
        }
        push_terminated(&mut text, &chat.messages[latest_index].text_content());
        text.push_str("@end latest\n");
    }

    if let Some(retry) = retry {
        text.push_str(&section_header("retry_context"));
        render_retry_context(&mut text, retry);
    }

    if !writable.is_empty() {
        text.push_str(&section_header("writable files"));
        for entry in &writable {
            render_file_block(&mut text, entry);
        }
    }

    AssembledPrompt { text, refreshed }
}
