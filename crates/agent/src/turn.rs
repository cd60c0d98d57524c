//! Turn service: persist, stream, loop, persist, close.
//!
//! `start` does everything that can still be refused with a plain error:
//! request validation, taking the conversation lock and the pre-turn upsert.
//! Once it returns a [`TurnHandle`] the turn runs in its own task and all
//! further outcomes travel over the event stream.

use std::sync::Arc;

use deepsearch_config::AppConfig;
use deepsearch_core::error::StoreError;
use deepsearch_core::message::{ConversationId, DEFAULT_TITLE, Message, assign_ordinals, derive_title};
use deepsearch_core::provider::Provider;
use deepsearch_core::store::{ConversationStore, UpsertOutcome};
use deepsearch_core::tool::ToolRegistry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::locks::ConversationLocks;
use crate::loop_runner::{AgentLoop, TurnFinish};
use crate::publisher::{DEFAULT_CHANNEL_CAPACITY, StreamPublisher};
use crate::stream_event::TurnEvent;
use crate::trace::TurnTrace;

/// Titles are cut to this many characters unless configured otherwise.
pub const DEFAULT_TITLE_MAX_CHARS: usize = 50;

/// A turn submission: the full client-side history plus an optional id.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: Option<ConversationId>,
    pub messages: Vec<Message>,
}

/// Failures that reject a turn before any streaming starts.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a finished turn went, for callers that wait on it.
#[derive(Debug, Clone)]
pub struct TurnSummary {
    pub conversation_id: ConversationId,
    pub finish: TurnFinish,
    pub steps: u32,
    /// Whether the post-turn history reached the store.
    pub persisted: bool,
}

/// A running turn.
pub struct TurnHandle {
    pub conversation_id: ConversationId,
    /// True when this turn created the conversation.
    pub created: bool,
    /// The turn's event stream; ends once the final state is persisted.
    pub events: mpsc::Receiver<TurnEvent>,
    cancel: CancellationToken,
    task: JoinHandle<TurnSummary>,
}

impl TurnHandle {
    /// Ask the turn to stop. Nothing further is persisted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Split into the event stream and the task that reports the summary.
    pub fn into_parts(self) -> (mpsc::Receiver<TurnEvent>, JoinHandle<TurnSummary>) {
        (self.events, self.task)
    }
}

/// Runs turns against one agent loop and one store.
pub struct TurnService {
    agent: Arc<AgentLoop>,
    store: Arc<dyn ConversationStore>,
    locks: Arc<ConversationLocks>,
    title_max_chars: usize,
    channel_capacity: usize,
}

impl TurnService {
    pub fn new(agent: Arc<AgentLoop>, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            agent,
            store,
            locks: Arc::new(ConversationLocks::new()),
            title_max_chars: DEFAULT_TITLE_MAX_CHARS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Wire a service from configuration around an already resolved model.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        model: &str,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        let max_steps = u32::try_from(config.agent.max_steps).unwrap_or(u32::MAX);
        let agent = AgentLoop::new(provider, model, config.default_temperature, tools)
            .with_max_steps(max_steps)
            .with_max_tokens(config.default_max_tokens)
            .with_system_prompt(config.agent.system_prompt.clone());
        Self::new(Arc::new(agent), store).with_title_max_chars(config.agent.title_max_chars)
    }

    pub fn with_title_max_chars(mut self, max: usize) -> Self {
        self.title_max_chars = max.max(1);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Validate, lock, persist the submitted history and start the turn.
    pub async fn start(&self, owner_id: &str, request: TurnRequest) -> Result<TurnHandle, TurnError> {
        let TurnRequest { conversation_id, mut messages } = request;

        if messages.is_empty() {
            return Err(TurnError::InvalidRequest("messages must not be empty".into()));
        }
        if let Some(dup) = messages.iter().find_map(|m| m.duplicate_call_id()) {
            return Err(TurnError::InvalidRequest(format!(
                "duplicate tool call id '{dup}' within one message"
            )));
        }

        let conversation_id = conversation_id
            .filter(|id| !id.as_str().trim().is_empty())
            .unwrap_or_default();

        let guard = self.locks.acquire(&conversation_id).await;
        let trace = TurnTrace::new(owner_id, &conversation_id);

        assign_ordinals(&mut messages);
        let title = derive_title(&messages, self.title_max_chars)
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());

        let span = trace
            .span("upsert-chat-transaction")
            .with("message_count", messages.len());
        let created = match self.store.upsert(owner_id, &conversation_id, &title, &messages).await {
            Ok(outcome) => {
                let created = outcome == UpsertOutcome::Created;
                trace.end(span.with("created", created), true);
                created
            }
            Err(e) => {
                trace.end(span.with("error", e.to_string()), false);
                trace.finish("rejected");
                return Err(e.into());
            }
        };

        info!(
            conversation_id = %conversation_id,
            owner_id,
            created,
            messages = messages.len(),
            "Turn accepted"
        );

        let cancel = CancellationToken::new();
        let (publisher, events) = StreamPublisher::channel(self.channel_capacity, cancel.clone());

        let run = TurnRun {
            agent: self.agent.clone(),
            store: self.store.clone(),
            locks: self.locks.clone(),
            owner_id: owner_id.to_string(),
            conversation_id: conversation_id.clone(),
            created,
            title,
            title_max_chars: self.title_max_chars,
        };
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let summary = run.execute(messages, publisher, trace, task_cancel).await;
            drop(guard);
            run.locks.prune_idle();
            summary
        });

        Ok(TurnHandle {
            conversation_id,
            created,
            events,
            cancel,
            task,
        })
    }
}

/// Everything the spawned half of a turn needs.
struct TurnRun {
    agent: Arc<AgentLoop>,
    store: Arc<dyn ConversationStore>,
    locks: Arc<ConversationLocks>,
    owner_id: String,
    conversation_id: ConversationId,
    created: bool,
    title: String,
    title_max_chars: usize,
}

impl TurnRun {
    async fn execute(
        &self,
        history: Vec<Message>,
        mut publisher: StreamPublisher,
        trace: TurnTrace,
        cancel: CancellationToken,
    ) -> TurnSummary {
        if self.created {
            publisher.announce_new_conversation(&self.conversation_id).await;
        }

        let outcome = self.agent.run(history, &mut publisher, &trace, &cancel).await;

        let persisted = match &outcome.finish {
            TurnFinish::Cancelled => {
                info!(conversation_id = %self.conversation_id, "Turn cancelled, keeping pre-turn history");
                false
            }
            finish => {
                let title = derive_title(&outcome.messages, self.title_max_chars)
                    .unwrap_or_else(|| self.title.clone());
                let span = trace
                    .span("update-chat-final")
                    .with("message_count", outcome.messages.len())
                    .with("title_length", title.chars().count());
                match self
                    .store
                    .upsert(&self.owner_id, &self.conversation_id, &title, &outcome.messages)
                    .await
                {
                    Ok(_) => {
                        trace.end(span, true);
                        true
                    }
                    Err(e) => {
                        trace.end(span.with("error", e.to_string()), false);
                        error!(
                            conversation_id = %self.conversation_id,
                            error = %e,
                            "Failed to persist turn"
                        );
                        // A failed generation already told the client.
                        if !matches!(finish, TurnFinish::Failed(_)) {
                            publisher.error().await;
                        }
                        false
                    }
                }
            }
        };

        trace.finish(outcome.finish.label());
        publisher.close().await;

        TurnSummary {
            conversation_id: self.conversation_id.clone(),
            finish: outcome.finish,
            steps: outcome.steps,
            persisted,
        }
    }
}
