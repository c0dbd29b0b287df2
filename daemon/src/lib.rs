//! The bb7 daemon: spawned by the editor plugin, speaks newline-delimited
//! JSON over stdio.
#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::io::Result as IoResult;
use std::sync::Arc;
use std::time::Duration;

use bb7_core::AppState;
use bb7_core::Config;
use bb7_core::HttpTransport;
use bb7_core::MemoryStateStore;
use bb7_core::OutgoingSender;
use bb7_core::StreamRegistry;
use bb7_protocol::OutgoingLine;
use bb7_protocol::ServerResponse;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;

mod dispatcher;

use crate::dispatcher::Flow;
use crate::dispatcher::MessageProcessor;

/// Requests above this size are a protocol violation and fatal.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Size of the bounded channels used to communicate between tasks. 128
/// messages is plenty for an interactive editor session.
const CHANNEL_CAPACITY: usize = 128;

/// Exit code for a fatal stdin error (unreadable input or an oversize line).
const EXIT_FATAL_STDIN: i32 = 2;

enum Incoming {
    Line(String),
    Oversize(usize),
    ReadError(String),
}

/// Run the daemon until shutdown or stdin EOF. Returns the process exit
/// code: 0 for a clean shutdown, non-zero only on a fatal stdin error.
pub async fn run_main() -> IoResult<i32> {
    // Install a simple subscriber so `tracing` output is visible on stderr
    // (stdout is the wire). Users control the level with `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let config = Arc::new(Config::load()?);

    let (incoming_tx, mut incoming_rx) = mpsc::channel::<Incoming>(CHANNEL_CAPACITY);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<OutgoingLine>(CHANNEL_CAPACITY);

    // Task: read newline-delimited requests from stdin.
    let stdin_reader_handle = tokio::spawn({
        async move {
            let stdin = io::stdin();
            let mut reader = BufReader::new(stdin);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if line.len() > MAX_LINE_BYTES {
                            let _ = incoming_tx.send(Incoming::Oversize(line.len())).await;
                            break;
                        }
                        let trimmed = line.trim_end_matches(['\n', '\r']);
                        if trimmed.is_empty() {
                            continue;
                        }
                        if incoming_tx
                            .send(Incoming::Line(trimmed.to_string()))
                            .await
                            .is_err()
                        {
                            // Receiver gone, nothing left to do.
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = incoming_tx.send(Incoming::ReadError(e.to_string())).await;
                        break;
                    }
                }
            }
            debug!("stdin reader finished");
        }
    });

    // Task: write outgoing response lines to stdout, one JSON object per
    // line, flushed after each so the front-end sees them promptly.
    let stdout_writer_handle = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(line) = outgoing_rx.recv().await {
            match serde_json::to_string(&line) {
                Ok(json) => {
                    if let Err(e) = stdout.write_all(json.as_bytes()).await {
                        error!("failed to write to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.write_all(b"\n").await {
                        error!("failed to write newline to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.flush().await {
                        error!("failed to flush stdout: {e}");
                        break;
                    }
                }
                Err(e) => error!("failed to serialize response: {e}"),
            }
        }
        info!("stdout writer exited (channel closed)");
    });

    // Process incoming requests on this task.
    let outgoing = OutgoingSender::new(outgoing_tx.clone());
    let state = Arc::new(Mutex::new(AppState::new(Box::new(MemoryStateStore::new()))));
    let registry = Arc::new(StreamRegistry::new());
    let transport = Arc::new(HttpTransport::new(
        config.api_base.clone(),
        config.api_key.clone(),
    ));
    let processor = MessageProcessor::new(state, registry, transport, outgoing.clone(), config);

    let mut exit_code = 0;
    while let Some(incoming) = incoming_rx.recv().await {
        match incoming {
            Incoming::Line(line) => {
                if let Flow::Shutdown = processor.process_line(&line).await {
                    info!("shutdown requested");
                    break;
                }
            }
            Incoming::Oversize(len) => {
                outgoing
                    .notify(ServerResponse::error(format!(
                        "request of {len} bytes exceeds the {MAX_LINE_BYTES} byte limit"
                    )))
                    .await;
                exit_code = EXIT_FATAL_STDIN;
                break;
            }
            Incoming::ReadError(message) => {
                outgoing
                    .notify(ServerResponse::error(format!("stdin error: {message}")))
                    .await;
                exit_code = EXIT_FATAL_STDIN;
                break;
            }
        }
    }

    // Drop our senders and give the writer a moment to drain buffered
    // responses before the process exits.
    drop(processor);
    drop(outgoing);
    drop(outgoing_tx);
    stdin_reader_handle.abort();
    let _ = tokio::time::timeout(Duration::from_secs(1), stdout_writer_handle).await;

    Ok(exit_code)
}
