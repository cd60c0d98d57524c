//! Stream publisher: the single ordered output channel of a turn.
//!
//! The publisher owns the only long-lived sender. A watcher task observes the
//! reader side and cancels the turn when the client goes away; it holds a
//! sender clone only until [`StreamPublisher::close`] stops it, so the reader
//! sees end-of-stream exactly once, when `close` runs.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use deepsearch_core::message::{ConversationId, ToolInvocation};
use deepsearch_core::tool::ToolCall;

use crate::stream_event::{ControlEvent, TurnEvent};

/// Text shown to the client when a turn fails. Details stay in the logs.
pub const GENERIC_ERROR_MESSAGE: &str = "Oops, an error occurred!";

/// Default buffer between the turn and its reader.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

pub struct StreamPublisher {
    tx: mpsc::Sender<TurnEvent>,
    cancel: CancellationToken,
    finished: CancellationToken,
    watcher: JoinHandle<()>,
    published: usize,
    reader_gone: bool,
}

impl StreamPublisher {
    /// Open a channel for one turn. Dropping the receiver cancels `cancel`.
    pub fn channel(capacity: usize, cancel: CancellationToken) -> (Self, mpsc::Receiver<TurnEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let finished = CancellationToken::new();

        let watch_tx = tx.clone();
        let watch_cancel = cancel.clone();
        let watch_finished = finished.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = watch_tx.closed() => {
                    debug!("Stream reader disconnected, cancelling turn");
                    watch_cancel.cancel();
                }
                _ = watch_finished.cancelled() => {}
            }
        });

        let publisher = Self {
            tx,
            cancel,
            finished,
            watcher,
            published: 0,
            reader_gone: false,
        };
        (publisher, rx)
    }

    /// Number of events delivered so far.
    pub fn published(&self) -> usize {
        self.published
    }

    async fn send(&mut self, event: TurnEvent) {
        if self.reader_gone {
            return;
        }
        if self.tx.send(event).await.is_err() {
            self.reader_gone = true;
            self.cancel.cancel();
            return;
        }
        self.published += 1;
    }

    /// Signal that this turn created `id`. Only honoured as the very first
    /// event of the stream; returns whether it was sent.
    pub async fn announce_new_conversation(&mut self, id: &ConversationId) -> bool {
        if self.published > 0 {
            debug!(conversation_id = %id, "Dropping late new-conversation signal");
            return false;
        }
        self.send(TurnEvent::Control(ControlEvent::NewConversation {
            conversation_id: id.to_string(),
        }))
        .await;
        self.published > 0
    }

    pub async fn text_delta(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.send(TurnEvent::TextDelta { text: text.to_string() }).await;
    }

    pub async fn tool_call(&mut self, call: &ToolCall) {
        self.send(TurnEvent::tool_call(call)).await;
    }

    pub async fn tool_result(&mut self, invocation: &ToolInvocation) {
        self.send(TurnEvent::tool_result(invocation)).await;
    }

    pub async fn step_limit_reached(&mut self, steps: u32) {
        self.send(TurnEvent::Control(ControlEvent::StepLimitReached { steps }))
            .await;
    }

    pub async fn error(&mut self) {
        self.send(TurnEvent::Error {
            message: GENERIC_ERROR_MESSAGE.to_string(),
        })
        .await;
    }

    /// Close the channel. Consumes the publisher, so it can only happen once.
    pub async fn close(self) {
        self.finished.cancel();
        let _ = self.watcher.await;
        drop(self.tx);
    }
}
