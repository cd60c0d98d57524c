//! `deepsearch ask`: run one turn and stream it to the terminal.
//!
//! Assistant text goes to stdout; tool activity and status lines go to
//! stderr. With `--json` every event is printed to stdout as one JSON line.

use std::io::Write;

use deepsearch_agent::{ControlEvent, TurnEvent, TurnFinish, TurnRequest};
use deepsearch_config::AppConfig;
use deepsearch_core::message::{ConversationId, InvocationState, Message};
use tracing::info;

pub async fn run(
    message: String,
    conversation: Option<String>,
    user: String,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    OPENROUTER_API_KEY=sk-or-v1-...   (recommended)");
        eprintln!("    OPENAI_API_KEY=sk-...             (for OpenAI direct)");
        eprintln!("    DEEPSEARCH_API_KEY=sk-...         (generic)");
        eprintln!();
        eprintln!("  Or add it to {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let turns = deepsearch_gateway::build_turn_service(&config).await?;

    // The turn carries the full history, so continuing means reloading it.
    let conversation_id = conversation.as_deref().map(ConversationId::from);
    let mut messages = match &conversation_id {
        Some(id) => turns
            .store()
            .get(&user, id)
            .await?
            .map(|c| c.messages)
            .unwrap_or_default(),
        None => Vec::new(),
    };
    messages.push(Message::user(message));

    let handle = turns
        .start(
            &user,
            TurnRequest {
                conversation_id,
                messages,
            },
        )
        .await?;
    let conversation_id = handle.conversation_id.clone();
    info!(conversation_id = %conversation_id, user = %user, "Turn started");
    let cancel = handle.cancellation_token();
    let (mut events, task) = handle.into_parts();

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match render(&event, json) {
                    Rendered::Stdout(text) => {
                        write!(stdout, "{text}")?;
                        stdout.flush()?;
                    }
                    Rendered::Stderr(text) => eprintln!("{text}"),
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                tracing::warn!(conversation_id = %conversation_id, "Interrupted, cancelling turn");
                cancel.cancel();
                eprintln!("\n  Cancelling...");
            }
        }
    }

    let summary = task.await?;
    info!(
        conversation_id = %conversation_id,
        steps = summary.steps,
        persisted = summary.persisted,
        finish = ?summary.finish,
        "Turn finished"
    );
    if !json {
        println!();
        eprintln!("\n  Conversation: {conversation_id}");
    }

    match summary.finish {
        TurnFinish::Failed(e) => Err(format!("Turn failed: {e}").into()),
        TurnFinish::Cancelled => Err("Turn cancelled".into()),
        TurnFinish::Done(_) if !summary.persisted => {
            Err("The answer could not be saved to the conversation store".into())
        }
        TurnFinish::Done(_) => Ok(()),
    }
}

/// Where an event ends up on the terminal.
#[derive(Debug, PartialEq)]
enum Rendered {
    Stdout(String),
    Stderr(String),
}

fn render(event: &TurnEvent, json: bool) -> Rendered {
    if json {
        let line = serde_json::to_string(event).unwrap_or_default();
        return Rendered::Stdout(format!("{line}\n"));
    }

    match event {
        TurnEvent::TextDelta { text } => Rendered::Stdout(text.clone()),
        TurnEvent::ToolCall { tool_name, args, .. } => Rendered::Stderr(format!("  [{tool_name}] {args}")),
        TurnEvent::ToolResult { tool_name, state, .. } => match state {
            InvocationState::Error { error } => Rendered::Stderr(format!("  [{tool_name}] failed: {error}")),
            _ => Rendered::Stderr(format!("  [{tool_name}] done")),
        },
        TurnEvent::Control(ControlEvent::NewConversation { conversation_id }) => {
            Rendered::Stderr(format!("  New conversation: {conversation_id}"))
        }
        TurnEvent::Control(ControlEvent::StepLimitReached { steps }) => {
            Rendered::Stderr(format!("\n  Stopped after {steps} steps"))
        }
        TurnEvent::Error { message } => Rendered::Stderr(format!("\n  [Error] {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_goes_to_stdout() {
        let event = TurnEvent::TextDelta { text: "Hello".into() };
        assert_eq!(render(&event, false), Rendered::Stdout("Hello".into()));
    }

    #[test]
    fn tool_activity_goes_to_stderr() {
        let call = TurnEvent::ToolCall {
            call_id: "c1".into(),
            tool_name: "search_web".into(),
            args: json!({"query": "rust"}),
        };
        assert_eq!(
            render(&call, false),
            Rendered::Stderr(r#"  [search_web] {"query":"rust"}"#.into())
        );

        let failed = TurnEvent::ToolResult {
            call_id: "c1".into(),
            tool_name: "scrape_pages".into(),
            state: InvocationState::Error { error: "timeout".into() },
        };
        assert_eq!(
            render(&failed, false),
            Rendered::Stderr("  [scrape_pages] failed: timeout".into())
        );
    }

    #[test]
    fn json_mode_prints_one_line_per_event() {
        let event = TurnEvent::Control(ControlEvent::NewConversation {
            conversation_id: "abc".into(),
        });
        let Rendered::Stdout(line) = render(&event, true) else {
            panic!("json output goes to stdout");
        };
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["type"], "control");
        assert_eq!(value["kind"], "new-conversation");
        assert_eq!(value["conversation_id"], "abc");
    }
}
