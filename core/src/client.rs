//! Transport to the chat-completion service.
//!
//! [`HttpTransport`] issues the streaming POST and decodes the SSE body into
//! typed [`StreamEvent`]s on a bounded channel, so the turn engine consumes a
//! plain event sequence and stays agnostic of the wire format. The
//! [`CompletionTransport`] trait is the seam tests script against.

use std::collections::BTreeMap;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use bb7_protocol::ReasoningEffort;
use bb7_protocol::Usage;

use crate::error::Bb7Err;

pub const TIMEOUT_MESSAGE: &str = "Request timed out.";

/// Size of the event channel between the SSE decoder task and the consumer.
const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    Reasoning(String),
    /// A tool call whose argument fragments concatenated into a complete
    /// JSON object (or whatever accumulated by stream end).
    ToolCall {
        name: String,
        arguments: String,
        index: u64,
    },
    Done {
        usage: Option<Usage>,
    },
    Error(String),
    /// The cancellation token fired. Classified distinctly from transport
    /// errors so the turn can take the abort path.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_message: String,
    pub tools: Vec<serde_json::Value>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub prompt_cache_key: Option<String>,
}

pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

/// Seam between the turn engine and the completion service. Implementations
/// return immediately; the stream ends with exactly one of `Done`, `Error`
/// or `Aborted`.
pub trait CompletionTransport: Send + Sync {
    fn stream(&self, request: CompletionRequest, cancel: CancellationToken) -> EventStream;
}

pub struct HttpTransport {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            api_key,
        }
    }
}

impl CompletionTransport for HttpTransport {
    fn stream(&self, request: CompletionRequest, cancel: CancellationToken) -> EventStream {
        let (tx_event, rx_event) = mpsc::channel(CHANNEL_CAPACITY);
        let url = format!(
            "{}/chat/completions",
            self.api_base.trim_end_matches('/')
        );
        tokio::spawn(run_stream(
            self.client.clone(),
            url,
            self.api_key.clone(),
            request,
            cancel,
            tx_event,
        ));
        EventStream::new(rx_event)
    }
}

fn build_payload(request: &CompletionRequest) -> serde_json::Value {
    let mut payload = json!({
        "model": request.model,
        "messages": [
            {"role": "system", "content": request.system_prompt},
            {"role": "user", "content": request.user_message},
        ],
        "stream": true,
        "tools": request.tools,
    });
    if let Some(effort) = request.reasoning_effort
        && effort != ReasoningEffort::None
    {
        payload["reasoning"] = json!({ "effort": effort });
    }
    if let Some(cache_key) = &request.prompt_cache_key {
        payload["prompt_cache_key"] = json!(cache_key);
    }
    payload
}

async fn run_stream(
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    request: CompletionRequest,
    cancel: CancellationToken,
    tx_event: mpsc::Sender<StreamEvent>,
) {
    let payload = build_payload(&request);
    debug!("POST {url} model={}", request.model);

    let mut req_builder = client.post(&url);
    if let Some(api_key) = &api_key {
        req_builder = req_builder.bearer_auth(api_key);
    }
    let send = req_builder
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .json(&payload)
        .send();

    let res = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = tx_event.send(StreamEvent::Aborted).await;
            return;
        }
        res = send => res,
    };

    match res {
        Ok(resp) if resp.status().is_success() => {
            let stream = resp.bytes_stream().map_err(Bb7Err::Reqwest);
            process_sse(stream, cancel, tx_event).await;
        }
        Ok(resp) => {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let _ = tx_event
                .send(StreamEvent::Error(format!(
                    "unexpected status {status}: {body}"
                )))
                .await;
        }
        Err(e) if e.is_timeout() => {
            let _ = tx_event
                .send(StreamEvent::Error(TIMEOUT_MESSAGE.to_string()))
                .await;
        }
        Err(e) => {
            let _ = tx_event.send(StreamEvent::Error(e.to_string())).await;
        }
    }
}

/// State accumulated for one tool call while its argument fragments stream
/// in. A call is forwarded the first time its buffer parses as JSON, or
/// flushed as-is when the stream terminates.
#[derive(Default)]
struct ToolCallState {
    name: Option<String>,
    arguments: String,
    emitted: bool,
}

async fn process_sse<S>(stream: S, cancel: CancellationToken, tx_event: mpsc::Sender<StreamEvent>)
where
    S: Stream<Item = crate::error::Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();

    let mut tool_calls: BTreeMap<u64, ToolCallState> = BTreeMap::new();
    let mut usage: Option<Usage> = None;

    let flush_tool_calls =
        |tool_calls: &mut BTreeMap<u64, ToolCallState>| -> Vec<StreamEvent> {
            tool_calls
                .iter_mut()
                .filter(|(_, state)| {
                    !state.emitted && (state.name.is_some() || !state.arguments.is_empty())
                })
                .map(|(index, state)| {
                    state.emitted = true;
                    StreamEvent::ToolCall {
                        name: state.name.clone().unwrap_or_default(),
                        arguments: state.arguments.clone(),
                        index: *index,
                    }
                })
                .collect()
        };

    loop {
        // No deadline of our own here: the server ends the stream and a
        // front-end cancel is the only timeout.
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx_event.send(StreamEvent::Aborted).await;
                return;
            }
            next = stream.next() => next,
        };

        let sse = match next {
            Some(Ok(sse)) => sse,
            Some(Err(e)) => {
                let _ = tx_event.send(StreamEvent::Error(e.to_string())).await;
                return;
            }
            None => {
                // Stream closed without [DONE]; flush and complete anyway.
                for event in flush_tool_calls(&mut tool_calls) {
                    let _ = tx_event.send(event).await;
                }
                let _ = tx_event.send(StreamEvent::Done { usage }).await;
                return;
            }
        };

        if sse.data.trim() == "[DONE]" {
            for event in flush_tool_calls(&mut tool_calls) {
                let _ = tx_event.send(event).await;
            }
            let _ = tx_event.send(StreamEvent::Done { usage }).await;
            return;
        }

        let chunk: serde_json::Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx_event
                    .send(StreamEvent::Error(format!("malformed SSE payload: {e}")))
                    .await;
                return;
            }
        };
        trace!("received SSE chunk: {chunk:?}");

        if let Some(parsed) = parse_usage(chunk.get("usage")) {
            usage = Some(parsed);
        }

        let Some(delta) = chunk
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|choice| choice.get("delta"))
        else {
            continue;
        };

        if let Some(content) = delta.get("content").and_then(|c| c.as_str())
            && !content.is_empty()
        {
            let _ = tx_event
                .send(StreamEvent::Content(content.to_string()))
                .await;
        }

        if let Some(reasoning) = delta.get("reasoning").and_then(|r| r.as_str())
            && !reasoning.is_empty()
        {
            let _ = tx_event
                .send(StreamEvent::Reasoning(reasoning.to_string()))
                .await;
        }

        let Some(calls) = delta.get("tool_calls").and_then(|tc| tc.as_array()) else {
            continue;
        };
        for call in calls {
            let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            let state = tool_calls.entry(index).or_default();

            if let Some(function) = call.get("function") {
                if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                    state.name.get_or_insert_with(|| name.to_string());
                }
                if let Some(fragment) = function.get("arguments").and_then(|a| a.as_str()) {
                    state.arguments.push_str(fragment);
                }
            }

            // Buffer-until-parseable: forward the call the first time the
            // accumulated fragments form a complete JSON document.
            if !state.emitted
                && !state.arguments.is_empty()
                && serde_json::from_str::<serde_json::Value>(&state.arguments).is_ok()
            {
                state.emitted = true;
                let _ = tx_event
                    .send(StreamEvent::ToolCall {
                        name: state.name.clone().unwrap_or_default(),
                        arguments: state.arguments.clone(),
                        index,
                    })
                    .await;
            }
        }
    }
}

fn parse_usage(value: Option<&serde_json::Value>) -> Option<Usage> {
    let value = value?;
    if !value.is_object() {
        return None;
    }
    Some(Usage {
        prompt_tokens: value.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        completion_tokens: value
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cached_tokens: value
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        total_tokens: value.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        cost: value.get("cost").and_then(|v| v.as_f64()).unwrap_or(0.0),
    })
}
