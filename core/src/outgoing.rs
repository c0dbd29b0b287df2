//! Channel-backed sender for response lines.
//!
//! Every response the daemon emits funnels through one bounded channel whose
//! receiver is the single stdout writer task. That gives a total order over
//! response lines even while a turn task and the dispatcher emit
//! concurrently.

use bb7_protocol::OutgoingLine;
use bb7_protocol::RequestId;
use bb7_protocol::ServerResponse;
use tokio::sync::mpsc;
use tracing::error;

#[derive(Clone)]
pub struct OutgoingSender {
    tx: mpsc::Sender<OutgoingLine>,
}

impl OutgoingSender {
    pub fn new(tx: mpsc::Sender<OutgoingLine>) -> Self {
        Self { tx }
    }

    /// Send a response correlated to a request. A send failure means the
    /// writer task is gone (front-end hung up); log and carry on.
    pub async fn send(&self, request_id: Option<RequestId>, response: ServerResponse) {
        let line = OutgoingLine {
            request_id,
            response,
        };
        if let Err(e) = self.tx.send(line).await {
            error!("failed to queue outgoing response: {e}");
        }
    }

    /// Send an uncorrelated notification, e.g. `title_updated`.
    pub async fn notify(&self, response: ServerResponse) {
        self.send(None, response).await;
    }
}
