//! End-to-end turn scenarios against a scripted transport: the full path
//! from send through streaming, patch application, commit and the final
//! response, with no network involved.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bb7_core::AppState;
use bb7_core::CompletionRequest;
use bb7_core::CompletionTransport;
use bb7_core::Config;
use bb7_core::EventStream;
use bb7_core::MemoryStateStore;
use bb7_core::StreamEvent;
use bb7_core::StreamRegistry;
use bb7_core::TurnContext;
use bb7_core::file_fingerprint;
use bb7_core::outgoing::OutgoingSender;
use bb7_core::run_send_turn;
use bb7_core::turn::SendArgs;
use bb7_protocol::ContextAction;
use bb7_protocol::ContextFile;
use bb7_protocol::DiffMode;
use bb7_protocol::MessagePart;
use bb7_protocol::OutgoingLine;
use bb7_protocol::ReasoningEffort;
use bb7_protocol::RequestId;
use bb7_protocol::Role;
use bb7_protocol::ServerResponse;
use bb7_protocol::Usage;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum Step {
    Emit(StreamEvent),
    /// Block until the turn's cancellation token fires, then report the
    /// abort. Stands in for a server stream interrupted by the client.
    AwaitCancel,
}

/// Pops one script per `stream` call; an exhausted transport answers with an
/// immediate empty completion (which keeps the title job inert).
struct ScriptedTransport {
    scripts: StdMutex<Vec<Vec<Step>>>,
}

impl ScriptedTransport {
    fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: StdMutex::new(scripts),
        }
    }
}

impl CompletionTransport for ScriptedTransport {
    fn stream(&self, _request: CompletionRequest, cancel: CancellationToken) -> EventStream {
        let steps = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![Step::Emit(StreamEvent::Done { usage: None })]
            } else {
                scripts.remove(0)
            }
        };
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            for step in steps {
                match step {
                    Step::Emit(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Step::AwaitCancel => {
                        cancel.cancelled().await;
                        let _ = tx.send(StreamEvent::Aborted).await;
                        return;
                    }
                }
            }
        });
        EventStream::new(rx)
    }
}

struct Harness {
    ctx: TurnContext,
    outgoing_rx: mpsc::Receiver<OutgoingLine>,
    state: Arc<Mutex<AppState>>,
    registry: Arc<StreamRegistry>,
}

async fn harness(diff_mode: DiffMode, scripts: Vec<Vec<Step>>) -> Harness {
    let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
    let state = Arc::new(Mutex::new(AppState::new(Box::new(MemoryStateStore::new()))));
    let registry = Arc::new(StreamRegistry::new());
    let config = Arc::new(Config {
        model: "test-model".to_string(),
        api_base: "http://unused.invalid".to_string(),
        api_key: None,
        diff_mode,
        reasoning_effort: ReasoningEffort::Medium,
        bb7_home: std::env::temp_dir().join("bb7-turn-scenarios"),
    });
    let ctx = TurnContext {
        state: state.clone(),
        registry: registry.clone(),
        transport: Arc::new(ScriptedTransport::new(scripts)),
        outgoing: OutgoingSender::new(outgoing_tx),
        config,
    };
    state
        .lock()
        .await
        .create_chat("test-model", ReasoningEffort::Medium)
        .expect("create chat");
    Harness {
        ctx,
        outgoing_rx,
        state,
        registry,
    }
}

async fn add_context(harness: &Harness, path: &str, content: &str) {
    let mut state = harness.state.lock().await;
    let chat = state.active_chat_mut().expect("active chat");
    chat.context_files.push(ContextFile {
        path: path.to_string(),
        content: content.to_string(),
        read_only: false,
        external: false,
        start_line: None,
        end_line: None,
        fingerprint: file_fingerprint(path, content),
    });
}

async fn add_output(harness: &Harness, path: &str, content: &str) {
    let mut state = harness.state.lock().await;
    let chat = state.active_chat_mut().expect("active chat");
    chat.outputs.insert(path.to_string(), content.to_string());
}

/// Run a whole send turn to completion and return every emitted response.
async fn run_send(harness: &mut Harness, content: &str) -> Vec<OutgoingLine> {
    let request_id = RequestId::Integer(1);
    assert!(harness.registry.reserve(&request_id));
    run_send_turn(
        harness.ctx.clone(),
        SendArgs {
            request_id,
            echo: true,
            content: content.to_string(),
            model: None,
            reasoning_effort: None,
            retry_context: None,
        },
    )
    .await;

    let mut responses = Vec::new();
    while let Ok(line) = harness.outgoing_rx.try_recv() {
        responses.push(line);
    }
    responses
}

fn final_response(responses: &[OutgoingLine]) -> &ServerResponse {
    &responses.last().expect("at least one response").response
}

fn count_chunks(responses: &[OutgoingLine]) -> (usize, usize) {
    let chunks = responses
        .iter()
        .filter(|l| matches!(l.response, ServerResponse::Chunk { .. }))
        .count();
    let thinking = responses
        .iter()
        .filter(|l| matches!(l.response, ServerResponse::Thinking { .. }))
        .count();
    (chunks, thinking)
}

fn assert_single_final(responses: &[OutgoingLine]) {
    // Response ordering: any number of chunk/thinking, then exactly one
    // final done | error | diff_error (an async title_updated may follow).
    let finals: Vec<usize> = responses
        .iter()
        .enumerate()
        .filter_map(|(i, l)| match l.response {
            ServerResponse::Done { .. }
            | ServerResponse::Error { .. }
            | ServerResponse::DiffError { .. } => Some(i),
            _ => None,
        })
        .collect();
    assert_eq!(finals.len(), 1, "expected exactly one final response");
    for (i, line) in responses.iter().enumerate() {
        if i < finals[0] {
            assert!(
                matches!(
                    line.response,
                    ServerResponse::Chunk { .. } | ServerResponse::Thinking { .. }
                ),
                "unexpected response before the final one: {:?}",
                line.response
            );
        }
    }
}

fn assistant_parts(harness: &Harness) -> Vec<MessagePart> {
    let state = harness.state.try_lock().expect("state unlocked");
    let chat = state.active_chat().expect("active chat");
    chat.messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .and_then(|m| m.parts.clone())
        .unwrap_or_default()
}

#[tokio::test]
async fn happy_path_writes_a_new_file() {
    let usage = Usage {
        prompt_tokens: 12,
        completion_tokens: 7,
        cached_tokens: 3,
        total_tokens: 19,
        cost: 0.0012,
    };
    let mut h = harness(
        DiffMode::SearchReplace,
        vec![vec![
            Step::Emit(StreamEvent::Content("I updated the file.".to_string())),
            Step::Emit(StreamEvent::Reasoning("Checking context…".to_string())),
            Step::Emit(StreamEvent::ToolCall {
                name: "write_file".to_string(),
                arguments: r#"{"path":"src/generated.go","content":"package main\n\nfunc main() {}\n"}"#.to_string(),
                index: 0,
            }),
            Step::Emit(StreamEvent::Done {
                usage: Some(usage.clone()),
            }),
        ]],
    )
    .await;

    let responses = run_send(&mut h, "please update the file").await;
    assert_single_final(&responses);
    let (chunks, thinking) = count_chunks(&responses);
    assert!(chunks >= 1);
    assert!(thinking >= 1);

    match final_response(&responses) {
        ServerResponse::Done {
            output_files,
            usage: done_usage,
            ..
        } => {
            assert_eq!(output_files, &vec!["src/generated.go".to_string()]);
            assert_eq!(done_usage.as_ref(), Some(&usage));
        }
        other => panic!("expected done, got {other:?}"),
    }

    {
        let state = h.state.lock().await;
        let chat = state.active_chat().expect("active chat");
        assert_eq!(
            chat.outputs.get("src/generated.go").map(String::as_str),
            Some("package main\n\nfunc main() {}\n")
        );
    }

    let parts = assistant_parts(&h);
    assert_eq!(parts.len(), 3);
    assert!(matches!(&parts[0], MessagePart::Thinking { content } if content == "Checking context…"));
    assert!(matches!(&parts[1], MessagePart::Text { content } if content == "I updated the file."));
    match &parts[2] {
        MessagePart::ContextEvent(event) => {
            assert_eq!(event.action, ContextAction::AssistantWriteFile);
            assert_eq!(event.path, "src/generated.go");
            assert!(event.added);
        }
        other => panic!("expected write event, got {other:?}"),
    }
}

#[tokio::test]
async fn multi_edit_batch_consolidates_into_one_write_event() {
    let base = "Goblin\nOrc\n";
    let fp = file_fingerprint("src/game.c", base);
    let args = serde_json::json!({
        "edits": [
            {"path": "src/game.c", "fileId": fp, "old": "Goblin", "new": "Goblin 👺"},
            {"path": "src/game.c", "fileId": fp, "old": "Orc", "new": "Orc 🪓"},
        ]
    })
    .to_string();

    let mut h = harness(
        DiffMode::SearchReplaceMulti,
        vec![vec![
            Step::Emit(StreamEvent::ToolCall {
                name: "edit_file".to_string(),
                arguments: args,
                index: 0,
            }),
            Step::Emit(StreamEvent::Done { usage: None }),
        ]],
    )
    .await;
    add_context(&h, "src/game.c", base).await;

    let responses = run_send(&mut h, "add emoji").await;
    assert_single_final(&responses);
    match final_response(&responses) {
        ServerResponse::Done { output_files, .. } => {
            assert_eq!(output_files, &vec!["src/game.c".to_string()]);
        }
        other => panic!("expected done, got {other:?}"),
    }

    {
        let state = h.state.lock().await;
        let chat = state.active_chat().expect("active chat");
        assert_eq!(
            chat.outputs.get("src/game.c").map(String::as_str),
            Some("Goblin 👺\nOrc 🪓\n")
        );
    }

    let write_events: Vec<_> = assistant_parts(&h)
        .into_iter()
        .filter(|p| {
            matches!(
                p,
                MessagePart::ContextEvent(e) if e.action == ContextAction::AssistantWriteFile
            )
        })
        .collect();
    assert_eq!(write_events.len(), 1);
}

#[tokio::test]
async fn file_id_mismatch_yields_diff_error_without_commit() {
    let pending = "Goblin 👺\n";
    let mut h = harness(
        DiffMode::SearchReplace,
        vec![vec![
            Step::Emit(StreamEvent::ToolCall {
                name: "edit_file".to_string(),
                arguments: serde_json::json!({
                    "path": "src/game.c",
                    "fileId": "wrong-file-id",
                    "old": "Goblin",
                    "new": "Gob",
                })
                .to_string(),
                index: 0,
            }),
            Step::Emit(StreamEvent::Done { usage: None }),
        ]],
    )
    .await;
    add_context(&h, "src/game.c", "Goblin\n").await;
    add_output(&h, "src/game.c", pending).await;

    let responses = run_send(&mut h, "rename the goblin").await;
    assert_single_final(&responses);

    // The base resolves to the pending output, so that is the expected id.
    let expected_fp = file_fingerprint("src/game.c", pending);
    match final_response(&responses) {
        ServerResponse::DiffError { errors, tool_calls, .. } => {
            assert!(errors[0].contains("file_id mismatch"));
            assert!(errors[0].contains(&expected_fp));
            assert_eq!(tool_calls.len(), 1);
            assert_eq!(tool_calls[0].tool, "edit_file");
            // Raw args are a decoded object, not a double-encoded string.
            assert_eq!(tool_calls[0].args["fileId"], "wrong-file-id");
        }
        other => panic!("expected diff_error, got {other:?}"),
    }

    let state = h.state.lock().await;
    let chat = state.active_chat().expect("active chat");
    assert_eq!(
        chat.outputs.get("src/game.c").map(String::as_str),
        Some(pending)
    );
}

#[tokio::test]
async fn duplicate_write_file_is_terminal() {
    let mut h = harness(
        DiffMode::SearchReplace,
        vec![vec![
            Step::Emit(StreamEvent::ToolCall {
                name: "write_file".to_string(),
                arguments: r#"{"path":"dup.go","content":"first"}"#.to_string(),
                index: 0,
            }),
            Step::Emit(StreamEvent::ToolCall {
                name: "write_file".to_string(),
                arguments: r#"{"path":"dup.go","content":"second"}"#.to_string(),
                index: 1,
            }),
            Step::Emit(StreamEvent::Done { usage: None }),
        ]],
    )
    .await;

    let responses = run_send(&mut h, "write it twice").await;
    assert_single_final(&responses);
    let expected = "Duplicate write_file for path in single response: dup.go";
    match final_response(&responses) {
        ServerResponse::Error { message } => assert!(message.contains(expected)),
        other => panic!("expected error, got {other:?}"),
    }

    let state = h.state.lock().await;
    let chat = state.active_chat().expect("active chat");
    assert!(!chat.outputs.contains_key("dup.go"));
    let system_text = chat
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::System)
        .and_then(|m| m.content.clone())
        .expect("system message");
    assert!(system_text.contains(expected));
}

#[tokio::test]
async fn multi_edit_mid_batch_failure_is_atomic() {
    let base = "L01\nL02\nL03\nL04\nL05\nL06\nL07\nL08\n";
    let fp = file_fingerprint("src/big.c", base);
    let args = serde_json::json!({
        "edits": [
            {"path": "src/big.c", "fileId": fp, "old": "L01", "new": "L01a"},
            {"path": "src/big.c", "fileId": fp, "old": "L02", "new": "L02a"},
            {"path": "src/big.c", "fileId": fp, "old": "MISSING_LINE", "new": "nope"},
            {"path": "src/big.c", "fileId": fp, "old": "L04", "new": "L04a"},
        ]
    })
    .to_string();

    let mut h = harness(
        DiffMode::SearchReplaceMulti,
        vec![vec![
            Step::Emit(StreamEvent::ToolCall {
                name: "edit_file".to_string(),
                arguments: args,
                index: 0,
            }),
            Step::Emit(StreamEvent::Done { usage: None }),
        ]],
    )
    .await;
    add_context(&h, "src/big.c", base).await;

    let responses = run_send(&mut h, "tweak all the lines").await;
    assert_single_final(&responses);
    match final_response(&responses) {
        ServerResponse::DiffError { errors, tool_calls, .. } => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("edit 2 (src/big.c"));
            assert!(errors[0].contains("old_string not found"));
            assert_eq!(tool_calls.len(), 1);
        }
        other => panic!("expected diff_error, got {other:?}"),
    }

    let state = h.state.lock().await;
    let chat = state.active_chat().expect("active chat");
    assert!(!chat.outputs.contains_key("src/big.c"));
}

#[tokio::test]
async fn cancellation_preserves_partial_text_and_reasoning() {
    let mut h = harness(
        DiffMode::SearchReplace,
        vec![vec![
            Step::Emit(StreamEvent::Reasoning("half a thought".to_string())),
            Step::Emit(StreamEvent::Content("partial answer".to_string())),
            Step::AwaitCancel,
        ]],
    )
    .await;

    let request_id = RequestId::Integer(1);
    assert!(h.registry.reserve(&request_id));
    let turn = tokio::spawn(run_send_turn(
        h.ctx.clone(),
        SendArgs {
            request_id: request_id.clone(),
            echo: true,
            content: "long question".to_string(),
            model: None,
            reasoning_effort: None,
            retry_context: None,
        },
    ));

    // Wait until the partial output has been streamed, then cancel.
    let first = h.outgoing_rx.recv().await.expect("thinking");
    assert!(matches!(first.response, ServerResponse::Thinking { .. }));
    let second = h.outgoing_rx.recv().await.expect("chunk");
    assert!(matches!(second.response, ServerResponse::Chunk { .. }));
    assert!(h.registry.cancel(Some(&request_id)));

    let last = h.outgoing_rx.recv().await.expect("final");
    match last.response {
        ServerResponse::Error { message } => assert_eq!(message, "Response aborted by user."),
        other => panic!("expected error, got {other:?}"),
    }
    turn.await.expect("turn task");
    assert!(!h.registry.has_active());

    let state = h.state.lock().await;
    let chat = state.active_chat().expect("active chat");
    let assistant = chat
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .expect("partial assistant message");
    let parts = assistant.parts.clone().expect("parts");
    assert!(
        matches!(&parts[0], MessagePart::Thinking { content } if content == "half a thought")
    );
    assert!(matches!(&parts[1], MessagePart::Text { content } if content == "partial answer"));
    assert!(
        !parts
            .iter()
            .any(|p| matches!(p, MessagePart::ContextEvent(_)))
    );
    let system_text = chat
        .messages
        .last()
        .filter(|m| m.role == Role::System)
        .and_then(|m| m.content.clone())
        .expect("abort system message");
    assert_eq!(system_text, "Response aborted by user.");
}

#[tokio::test]
async fn anchored_duplicate_path_is_terminal() {
    let base = "a\nb\n";
    let fp = file_fingerprint("src/x.c", base);
    let edit = |content: &str| {
        serde_json::json!({
            "path": "src/x.c",
            "fileId": fp,
            "changes": [{"start": 1, "end": 1, "content": content}],
        })
        .to_string()
    };
    let mut h = harness(
        DiffMode::Anchored,
        vec![vec![
            Step::Emit(StreamEvent::ToolCall {
                name: "edit_file".to_string(),
                arguments: edit("A"),
                index: 0,
            }),
            Step::Emit(StreamEvent::ToolCall {
                name: "edit_file".to_string(),
                arguments: edit("AA"),
                index: 1,
            }),
            Step::Emit(StreamEvent::Done { usage: None }),
        ]],
    )
    .await;
    add_context(&h, "src/x.c", base).await;

    let responses = run_send(&mut h, "edit twice").await;
    match final_response(&responses) {
        ServerResponse::Error { message } => {
            assert!(message.contains("Duplicate edit_file for path in single response: src/x.c"));
        }
        other => panic!("expected error, got {other:?}"),
    }

    let state = h.state.lock().await;
    assert!(
        state
            .active_chat()
            .expect("active chat")
            .outputs
            .is_empty()
    );
}

#[tokio::test]
async fn missing_base_is_collected_not_terminal() {
    let mut h = harness(
        DiffMode::SearchReplace,
        vec![vec![
            Step::Emit(StreamEvent::ToolCall {
                name: "edit_file".to_string(),
                arguments: serde_json::json!({
                    "path": "ghost.rs",
                    "old": "x",
                    "new": "y",
                })
                .to_string(),
                index: 0,
            }),
            Step::Emit(StreamEvent::Content("done editing".to_string())),
            Step::Emit(StreamEvent::Done { usage: None }),
        ]],
    )
    .await;

    let responses = run_send(&mut h, "edit a file that is not there").await;
    match final_response(&responses) {
        ServerResponse::DiffError { errors, .. } => {
            assert!(errors[0].contains("ghost.rs"));
            assert!(errors[0].contains("no base file found"));
        }
        other => panic!("expected diff_error, got {other:?}"),
    }
}
