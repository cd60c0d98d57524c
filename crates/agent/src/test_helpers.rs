//! Scripted collaborators for driving turns in tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deepsearch_core::error::{ProviderError, ToolError};
use deepsearch_core::message::{InvocationState, Message};
use deepsearch_core::provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk};
use deepsearch_core::tool::{Tool, ToolCall};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Build a tool call.
pub fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

/// One scripted generation step.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Stream `deltas`, then finish with `calls`.
    Reply { deltas: Vec<String>, calls: Vec<ToolCall> },
    /// Stream `deltas`, then fail with `error`.
    Fail { deltas: Vec<String>, error: ProviderError },
}

impl ScriptStep {
    pub fn text(deltas: &[&str]) -> Self {
        Self::calls(deltas, Vec::new())
    }

    pub fn calls(deltas: &[&str], calls: Vec<ToolCall>) -> Self {
        Self::Reply {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            calls,
        }
    }

    pub fn fail(deltas: &[&str], error: ProviderError) -> Self {
        Self::Fail {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            error,
        }
    }
}

/// A provider that plays back a script, one step per request.
///
/// When the script runs out it repeats the fallback step if one is set
/// (with fresh call ids), otherwise it fails with `NotConfigured`.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptStep>>,
    fallback: Option<ScriptStep>,
    requests: Arc<Mutex<Vec<ProviderRequest>>>,
    served: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            requests: Arc::new(Mutex::new(Vec::new())),
            served: AtomicUsize::new(0),
        }
    }

    /// A model that requests `tool` on every single step.
    pub fn always_calling(tool: &str, arguments: Value) -> Self {
        let mut provider = Self::new(Vec::new());
        provider.fallback = Some(ScriptStep::calls(&[], vec![call("", tool, arguments)]));
        provider
    }

    /// Every request received so far, shared with the provider.
    pub fn requests(&self) -> Arc<Mutex<Vec<ProviderRequest>>> {
        self.requests.clone()
    }

    fn next_step(&self, request: ProviderRequest) -> ScriptStep {
        self.requests.lock().push(request);
        let n = self.served.fetch_add(1, Ordering::SeqCst);
        if let Some(step) = self.script.lock().pop_front() {
            return step;
        }
        match &self.fallback {
            Some(ScriptStep::Reply { deltas, calls }) => ScriptStep::Reply {
                deltas: deltas.clone(),
                calls: calls
                    .iter()
                    .enumerate()
                    .map(|(i, c)| ToolCall {
                        id: format!("scripted_{n}_{i}"),
                        ..c.clone()
                    })
                    .collect(),
            },
            Some(other) => other.clone(),
            None => ScriptStep::fail(&[], ProviderError::NotConfigured("script exhausted".into())),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        request: ProviderRequest,
        _cancel: &CancellationToken,
    ) -> Result<ProviderResponse, ProviderError> {
        match self.next_step(request) {
            ScriptStep::Reply { deltas, calls } => Ok(ProviderResponse {
                message: Message::assistant_step(
                    deltas.concat(),
                    calls.into_iter().map(|c| c.into_invocation(InvocationState::Pending)).collect(),
                ),
                usage: None,
                model: "scripted-model".into(),
            }),
            ScriptStep::Fail { error, .. } => Err(error),
        }
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        _cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let step = self.next_step(request);
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let (deltas, ending) = match step {
                ScriptStep::Reply { deltas, calls } => (deltas, Ok(calls)),
                ScriptStep::Fail { deltas, error } => (deltas, Err(error)),
            };
            for delta in deltas {
                let chunk = StreamChunk {
                    content: Some(delta),
                    ..StreamChunk::default()
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            let last = ending.map(|tool_calls| StreamChunk {
                tool_calls,
                done: true,
                ..StreamChunk::default()
            });
            let _ = tx.send(last).await;
        });
        Ok(rx)
    }
}

/// A tool with a canned outcome and an optional delay.
pub struct StubTool {
    name: String,
    outcome: Result<Value, String>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl StubTool {
    pub fn new(name: &str, result: Value) -> Self {
        Self {
            name: name.to_string(),
            outcome: Ok(result),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(name: &str, reason: &str) -> Self {
        Self {
            outcome: Err(reason.to_string()),
            ..Self::new(name, Value::Null)
        }
    }

    /// Wait `delay` before answering. Cancellation cuts the wait short.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Shared execution counter.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Tool for StubTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Stub tool for tests"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _arguments: Value, cancel: &CancellationToken) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ToolError::ExecutionFailed {
                        tool_name: self.name.clone(),
                        reason: "cancelled".into(),
                    });
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        self.outcome.clone().map_err(|reason| ToolError::ExecutionFailed {
            tool_name: self.name.clone(),
            reason,
        })
    }
}
