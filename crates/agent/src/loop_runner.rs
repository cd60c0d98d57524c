//! The turn orchestration loop.
//!
//! ```text
//! Generating ──no tool calls──▶ Done(Stop)
//!     │
//!     └─tool calls─▶ AwaitingTools ─▶ Continuing ─┬─▶ Generating
//!                                                 └─step cap─▶ Done(StepLimit)
//! model error (any state) ─▶ Failed
//! ```
//!
//! The loop owns the working history for the duration of a turn and never
//! touches the conversation store; persistence is the caller's job.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use deepsearch_core::error::ProviderError;
use deepsearch_core::message::{InvocationState, Message, ToolInvocation, assign_ordinals};
use deepsearch_core::provider::{Provider, ProviderRequest};
use deepsearch_core::tool::{ToolCall, ToolRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::prompt;
use crate::publisher::StreamPublisher;
use crate::trace::TurnTrace;

/// Generation steps allowed per turn unless configured otherwise.
pub const DEFAULT_MAX_STEPS: u32 = 10;

/// States of the orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Generating,
    AwaitingTools,
    Continuing,
    Done,
    Failed,
}

/// Why a turn reached `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model answered without requesting tools.
    Stop,
    /// The step cap was hit while the model still wanted tools.
    StepLimit,
}

/// How a turn ended.
#[derive(Debug, Clone)]
pub enum TurnFinish {
    Done(FinishReason),
    Failed(ProviderError),
    Cancelled,
}

impl TurnFinish {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Done(FinishReason::Stop) => "done",
            Self::Done(FinishReason::StepLimit) => "step_limit",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// The result of running the loop over one turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Pre-turn history followed by everything the turn appended, with
    /// dense ordinals.
    pub messages: Vec<Message>,
    /// Length of the pre-turn history within `messages`.
    pub prior_len: usize,
    pub finish: TurnFinish,
    /// Generation steps started.
    pub steps: u32,
}

impl TurnOutcome {
    /// Messages appended by this turn.
    pub fn appended(&self) -> &[Message] {
        &self.messages[self.prior_len.min(self.messages.len())..]
    }
}

/// What one generation step produced.
struct Generation {
    text: String,
    calls: Vec<ToolCall>,
}

/// The core agent loop that orchestrates model calls and tool execution.
pub struct AgentLoop {
    /// The model capability
    provider: Arc<dyn Provider>,

    /// The model to use
    model: String,

    /// Temperature setting
    temperature: f32,

    /// Default max tokens per response
    max_tokens: Option<u32>,

    /// Replaces the built-in guidance in the system prompt
    system_prompt: Option<String>,

    /// Tool registry
    tools: Arc<ToolRegistry>,

    /// Maximum generation steps per turn
    max_steps: u32,
}

impl AgentLoop {
    /// Create a new agent loop.
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        temperature: f32,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature,
            max_tokens: None,
            system_prompt: None,
            tools,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Set the maximum number of generation steps. Values below 1 are treated as 1.
    pub fn with_max_steps(mut self, max: u32) -> Self {
        self.max_steps = max.max(1);
        self
    }

    /// Set the default max tokens per model response.
    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Replace the built-in system prompt guidance.
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// Run one turn over `history`, publishing as it goes.
    ///
    /// Tool failures are folded into their invocation and fed back to the
    /// model. A model failure stops the loop and publishes a generic error
    /// event; whatever text the failing step already streamed is kept as a
    /// final assistant message. On cancellation nothing further is appended.
    pub async fn run(
        &self,
        history: Vec<Message>,
        publisher: &mut StreamPublisher,
        trace: &TurnTrace,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let prior_len = history.len();
        let mut messages = history;
        let definitions = self.tools.definitions();
        let system = prompt::system_prompt(self.system_prompt.as_deref(), Utc::now());

        info!(
            messages = prior_len,
            max_steps = self.max_steps,
            "Starting turn"
        );

        let mut step = 0u32;
        let finish = loop {
            if cancel.is_cancelled() {
                break TurnFinish::Cancelled;
            }
            step += 1;
            let mut state = LoopState::Generating;
            debug!(step, ?state, "Agent loop step");

            let request = ProviderRequest {
                model: self.model.clone(),
                system: Some(system.clone()),
                messages: messages.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                tools: definitions.clone(),
            };

            let span = trace.span("generation-step").with("step", step);
            let Generation { text, calls } = match self.generate(request, publisher, cancel).await {
                Ok(generation) => {
                    trace.end(span, true);
                    generation
                }
                Err((ProviderError::Cancelled, _)) => {
                    trace.end(span, false);
                    break TurnFinish::Cancelled;
                }
                Err((_, _)) if cancel.is_cancelled() => {
                    trace.end(span, false);
                    break TurnFinish::Cancelled;
                }
                Err((e, partial)) => {
                    let mut span = span;
                    span.set("error", e.to_string());
                    trace.end(span, false);
                    state = LoopState::Failed;
                    error!(step, ?state, error = %e, "Model generation failed");
                    if !partial.is_empty() {
                        messages.push(Message::assistant(partial));
                    }
                    publisher.error().await;
                    break TurnFinish::Failed(e);
                }
            };

            let calls = ensure_unique_call_ids(calls, step);
            if calls.is_empty() {
                messages.push(Message::assistant(text));
                state = LoopState::Done;
                debug!(step, ?state, "Model answered without tools");
                break TurnFinish::Done(FinishReason::Stop);
            }

            state = LoopState::AwaitingTools;
            debug!(step, ?state, tool_count = calls.len(), "Dispatching tool calls");
            for call in &calls {
                publisher.tool_call(call).await;
            }

            // join_all yields outcomes in request order whatever the completion order
            let outcomes = futures::future::join_all(
                calls.iter().map(|call| self.dispatch(call, trace, cancel)),
            )
            .await;

            if cancel.is_cancelled() {
                break TurnFinish::Cancelled;
            }

            let invocations: Vec<ToolInvocation> = calls
                .into_iter()
                .zip(outcomes)
                .map(|(call, outcome)| call.into_invocation(outcome))
                .collect();
            for invocation in &invocations {
                publisher.tool_result(invocation).await;
            }

            state = LoopState::Continuing;
            messages.push(Message::assistant_step(text, invocations));
            debug!(step, ?state, "Tool outcomes attached");

            if step >= self.max_steps {
                warn!(steps = step, "Step limit reached with tool calls outstanding");
                publisher.step_limit_reached(step).await;
                break TurnFinish::Done(FinishReason::StepLimit);
            }
        };

        assign_ordinals(&mut messages);
        info!(
            steps = step,
            appended = messages.len() - prior_len,
            outcome = finish.label(),
            "Turn loop finished"
        );

        TurnOutcome {
            messages,
            prior_len,
            finish,
            steps: step,
        }
    }

    /// Stream one generation, forwarding text deltas as they arrive.
    /// On failure returns the error with the text streamed so far.
    async fn generate(
        &self,
        request: ProviderRequest,
        publisher: &mut StreamPublisher,
        cancel: &CancellationToken,
    ) -> Result<Generation, (ProviderError, String)> {
        let mut rx = self
            .provider
            .stream(request, cancel)
            .await
            .map_err(|e| (e, String::new()))?;

        let mut text = String::new();
        let mut calls = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err((ProviderError::Cancelled, text)),
                next = rx.recv() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err((e, text)),
                None => {
                    return Err((
                        ProviderError::StreamInterrupted("stream ended before completion".into()),
                        text,
                    ));
                }
            };

            if let Some(delta) = chunk.content.as_deref() {
                publisher.text_delta(delta).await;
                text.push_str(delta);
            }
            calls.extend(chunk.tool_calls);
            if let Some(usage) = &chunk.usage {
                debug!(
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "Generation usage"
                );
            }
            if chunk.done {
                return Ok(Generation { text, calls });
            }
        }
    }

    async fn dispatch(
        &self,
        call: &ToolCall,
        trace: &TurnTrace,
        cancel: &CancellationToken,
    ) -> InvocationState {
        let span = trace
            .span(format!("tool:{}", call.name))
            .with("call_id", call.id.clone());
        let outcome = self.tools.invoke(call, cancel).await;
        trace.end(span, !matches!(outcome, InvocationState::Error { .. }));
        outcome
    }
}

/// Give every call in a step a non-empty id that is unique within the step.
fn ensure_unique_call_ids(calls: Vec<ToolCall>, step: u32) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .enumerate()
        .map(|(index, mut call)| {
            if call.id.is_empty() || seen.contains(&call.id) {
                let mut candidate = format!("call_{step}_{index}");
                while seen.contains(&candidate) {
                    candidate.push('_');
                }
                warn!(tool = %call.name, original = %call.id, assigned = %candidate, "Reassigning tool call id");
                call.id = candidate;
            }
            seen.insert(call.id.clone());
            call
        })
        .collect()
}
