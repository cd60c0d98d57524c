//! Request-scoped turn tracing.
//!
//! A `TurnTrace` is created per turn and handed to everything that does work
//! on its behalf. Spans are recorded in memory and every finished span is
//! also emitted as a `tracing` event, so any subscriber can act as the sink.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use deepsearch_core::message::ConversationId;

/// A finished unit of work within a turn.
#[derive(Debug, Clone, Serialize)]
pub struct TraceSpan {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A span that has started but not yet ended.
#[must_use = "an open span is only recorded when passed to TurnTrace::end"]
pub struct OpenSpan {
    name: String,
    started_at: DateTime<Utc>,
    started: Instant,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl OpenSpan {
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

/// All spans of one turn.
pub struct TurnTrace {
    trace_id: String,
    user_id: String,
    conversation_id: ConversationId,
    started: Instant,
    spans: Mutex<Vec<TraceSpan>>,
}

impl TurnTrace {
    pub fn new(user_id: impl Into<String>, conversation_id: &ConversationId) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            conversation_id: conversation_id.clone(),
            started: Instant::now(),
            spans: Mutex::new(Vec::new()),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span(&self, name: impl Into<String>) -> OpenSpan {
        OpenSpan {
            name: name.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// End `span` and record it.
    pub fn end(&self, span: OpenSpan, success: bool) {
        let finished = TraceSpan {
            duration_ms: span.started.elapsed().as_millis() as u64,
            name: span.name,
            started_at: span.started_at,
            success,
            metadata: span.metadata,
        };

        let metadata = serde_json::Value::Object(finished.metadata.clone());
        if success {
            debug!(
                trace_id = %self.trace_id,
                conversation_id = %self.conversation_id,
                span = %finished.name,
                duration_ms = finished.duration_ms,
                %metadata,
                "Span finished"
            );
        } else {
            warn!(
                trace_id = %self.trace_id,
                conversation_id = %self.conversation_id,
                span = %finished.name,
                duration_ms = finished.duration_ms,
                %metadata,
                "Span failed"
            );
        }
        self.spans.lock().push(finished);
    }

    /// Snapshot of the spans recorded so far, in completion order.
    pub fn spans(&self) -> Vec<TraceSpan> {
        self.spans.lock().clone()
    }

    /// Emit the turn summary. Called once when the turn is over.
    pub fn finish(&self, outcome: &str) {
        let spans = self.spans.lock();
        let failed = spans.iter().filter(|s| !s.success).count();
        info!(
            trace_id = %self.trace_id,
            user_id = %self.user_id,
            conversation_id = %self.conversation_id,
            spans = spans.len(),
            failed_spans = failed,
            duration_ms = self.started.elapsed().as_millis() as u64,
            outcome,
            "Turn finished"
        );
    }
}
